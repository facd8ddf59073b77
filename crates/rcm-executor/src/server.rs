//! Top-level bootstrap: listen, run the lifecycle loop, collect the
//! poller, report the first fatal error.

use rcm_core::error::Result;
use rcm_core::fabric::Fabric;
use rcm_core::progress::{Progress, ProgressSink};

use crate::config::ServerConfig;
use crate::connection::ConnectionTable;
use crate::context::ResourceContext;
use crate::handler::CompletionHandler;
use crate::lifecycle::ConnectionManager;
use crate::registrar::{MemoryRegistrar, RegistrarStats};
use crate::supervisor::Supervisor;

use std::sync::Arc;

pub struct Server<F: Fabric> {
    fabric: Arc<F>,
    config: ServerConfig,
    sink: Arc<dyn ProgressSink>,
    supervisor: Arc<Supervisor>,
    table: Arc<ConnectionTable>,
    stats: Arc<RegistrarStats>,
}

impl<F: Fabric> Server<F> {
    pub fn new(fabric: Arc<F>, config: ServerConfig, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            fabric,
            config,
            sink,
            supervisor: Arc::new(Supervisor::new()),
            table: Arc::new(ConnectionTable::new()),
            stats: Arc::new(RegistrarStats::default()),
        }
    }

    /// Stop handle: `finish()` ends both loops cleanly, `fail()` with an
    /// error.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn connections(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.table)
    }

    pub fn buffer_stats(&self) -> Arc<RegistrarStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until a fatal error or a stop request.
    pub fn run(self) -> Result<()> {
        let handler = Arc::new(CompletionHandler::new(
            Arc::clone(&self.table),
            Arc::clone(&self.sink),
        ));
        let context = Arc::new(ResourceContext::new(
            Arc::clone(&self.fabric),
            self.config.cq_depth,
            handler,
            Arc::clone(&self.supervisor),
        ));
        let registrar = MemoryRegistrar::new(
            Arc::clone(&self.fabric),
            self.config.buffer_size,
            Arc::clone(&self.stats),
        );
        let mut manager = ConnectionManager::new(
            Arc::clone(&self.fabric),
            Arc::clone(&context),
            registrar,
            Arc::clone(&self.table),
            Arc::clone(&self.sink),
            self.config.qp_caps,
        );

        let local = self
            .fabric
            .listen(self.config.bind_addr(), self.config.backlog)?;
        log::info!("server: listening on {}", local);
        self.sink.report(Progress::Listening { port: local.port() });

        let fabric = Arc::clone(&self.fabric);
        self.supervisor.register_waker(move || fabric.shutdown_events());

        self.event_loop(&mut manager);

        self.supervisor.finish();
        context.join_poller();
        if !manager.is_empty() {
            log::info!("server: exiting with {} open connections", manager.len());
        }
        match self.supervisor.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn event_loop(&self, manager: &mut ConnectionManager<F>) {
        while !self.supervisor.is_cancelled() {
            let event = match self.fabric.receive_next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    self.supervisor.fail(e);
                    break;
                }
            };
            if self.supervisor.is_cancelled() {
                log::debug!("server: dropping {} after shutdown", event.kind);
                break;
            }
            if let Err(e) = manager.dispatch(&event) {
                self.supervisor.fail(e);
                break;
            }
        }
    }
}
