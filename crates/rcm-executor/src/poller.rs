//! Completion Poller.
//!
//! ```text
//! loop {
//!     1. Block on the completion channel
//!     2. Ack that one event
//!     3. Re-arm notification (before draining, so nothing slips between)
//!     4. Drain the CQ, FIFO, handing each completion to the handler
//! }
//! ```
//!
//! Exits when the channel is interrupted or the shared token is cancelled.
//! A fatal error goes to the supervisor, which stops the lifecycle loop too.

use rcm_core::completion::WorkCompletion;
use rcm_core::error::Result;
use rcm_core::fabric::Fabric;
use rcm_core::handle::{ChannelHandle, CqHandle};

use crate::handler::CompletionHandler;
use crate::supervisor::Supervisor;

use std::sync::Arc;

pub struct CompletionPoller<F: Fabric> {
    fabric: Arc<F>,
    cq: CqHandle,
    channel: ChannelHandle,
    handler: Arc<CompletionHandler>,
    supervisor: Arc<Supervisor>,
    batch: usize,
}

impl<F: Fabric> CompletionPoller<F> {
    pub fn new(
        fabric: Arc<F>,
        cq: CqHandle,
        channel: ChannelHandle,
        handler: Arc<CompletionHandler>,
        supervisor: Arc<Supervisor>,
        batch: usize,
    ) -> Self {
        Self {
            fabric,
            cq,
            channel,
            handler,
            supervisor,
            batch: batch.max(1),
        }
    }

    /// Thread body.
    pub fn run(self) {
        log::debug!("poller: started on {} / {}", self.cq, self.channel);
        if let Err(e) = self.poll_loop() {
            self.supervisor.fail(e);
        }
        log::debug!("poller: exited");
    }

    fn poll_loop(&self) -> Result<()> {
        let mut wcs = vec![WorkCompletion::EMPTY; self.batch];
        loop {
            let cq = match self.fabric.get_cq_event(self.channel)? {
                Some(cq) => cq,
                None => return Ok(()),
            };
            if self.supervisor.is_cancelled() {
                return Ok(());
            }
            self.fabric.ack_cq_events(cq, 1);
            self.fabric.req_notify_cq(cq)?;

            loop {
                let n = self.fabric.poll_cq(cq, &mut wcs)?;
                if n == 0 {
                    break;
                }
                for wc in &wcs[..n] {
                    self.handler.handle(wc)?;
                }
            }
        }
    }
}
