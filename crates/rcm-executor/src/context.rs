//! Resource Context: the one endpoint, PD, CQ and completion channel the
//! whole process shares, plus the poller thread draining that CQ.
//!
//! Built lazily by the first connection request and bound to that
//! request's endpoint from then on. Only the lifecycle loop calls
//! `ensure`.

use rcm_core::error::{FabricError, Result};
use rcm_core::fabric::Fabric;
use rcm_core::handle::{ChannelHandle, CqHandle, EndpointId, PdHandle};

use crate::handler::CompletionHandler;
use crate::poller::CompletionPoller;
use crate::supervisor::Supervisor;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Handles of a bound context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub endpoint: EndpointId,
    pub pd: PdHandle,
    pub cq: CqHandle,
    pub channel: ChannelHandle,
}

pub struct ResourceContext<F: Fabric> {
    fabric: Arc<F>,
    cq_depth: u32,
    handler: Arc<CompletionHandler>,
    supervisor: Arc<Supervisor>,
    bound: Mutex<Option<Resources>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Fabric> ResourceContext<F> {
    pub fn new(
        fabric: Arc<F>,
        cq_depth: u32,
        handler: Arc<CompletionHandler>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            fabric,
            cq_depth,
            handler,
            supervisor,
            bound: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn resources(&self) -> Option<Resources> {
        *lock(&self.bound)
    }

    /// Bind to `endpoint` on first use; afterwards only check it.
    pub fn ensure(&self, endpoint: EndpointId) -> Result<Resources> {
        let mut bound = lock(&self.bound);
        if let Some(res) = *bound {
            if res.endpoint != endpoint {
                return Err(FabricError::EndpointMismatch {
                    bound: res.endpoint,
                    requested: endpoint,
                });
            }
            return Ok(res);
        }

        let pd = self.fabric.alloc_pd(endpoint)?;
        let channel = self.fabric.create_comp_channel(endpoint)?;
        let cq = self.fabric.create_cq(endpoint, self.cq_depth, channel)?;
        self.fabric.req_notify_cq(cq)?;
        let res = Resources {
            endpoint,
            pd,
            cq,
            channel,
        };

        let poller = CompletionPoller::new(
            Arc::clone(&self.fabric),
            cq,
            channel,
            Arc::clone(&self.handler),
            Arc::clone(&self.supervisor),
            self.cq_depth as usize,
        );
        let handle = thread::Builder::new()
            .name("rcm-cq-poller".into())
            .spawn(move || poller.run())
            .map_err(|e| FabricError::os("pthread_create", e))?;
        *lock(&self.poller) = Some(handle);

        let fabric = Arc::clone(&self.fabric);
        self.supervisor
            .register_waker(move || fabric.interrupt_channel(channel));

        log::info!(
            "context: bound to {} ({}, {} depth {}, {})",
            endpoint,
            pd,
            cq,
            self.cq_depth,
            channel
        );
        *bound = Some(res);
        Ok(res)
    }

    /// Wait for the poller to exit. The channel must be interrupted first.
    pub fn join_poller(&self) {
        let handle = lock(&self.poller).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("context: poller thread panicked");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
