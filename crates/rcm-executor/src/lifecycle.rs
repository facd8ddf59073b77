//! Connection Lifecycle Manager.
//!
//! Runs on the main thread, one event at a time:
//!
//! | Event           | Action                                                    |
//! |-----------------|-----------------------------------------------------------|
//! | CONNECT_REQUEST | ensure context, create QP, register buffers, post recv, accept |
//! | ESTABLISHED     | write the outbound message, post one signaled send        |
//! | DISCONNECTED    | destroy QP, dereg MRs, free buffers, drop conn, destroy id |
//! | anything else   | fatal                                                     |
//!
//! The receive is always posted before the accept goes out, so a message
//! sent right after establishment has somewhere to land.

use rcm_core::error::{FabricError, Result};
use rcm_core::event::{CmEvent, CmEventKind};
use rcm_core::fabric::Fabric;
use rcm_core::handle::{CmId, ConnId};
use rcm_core::progress::{Progress, ProgressSink};
use rcm_core::work_request::{QpCaps, QpInitAttr};

use crate::connection::{ConnState, Connection, ConnectionTable};
use crate::context::ResourceContext;
use crate::registrar::MemoryRegistrar;

use std::collections::HashMap;
use std::sync::Arc;

/// Text of the one message sent to every peer.
pub fn outbound_message() -> String {
    format!("message from passive/server side with pid {}", std::process::id())
}

pub struct ConnectionManager<F: Fabric> {
    fabric: Arc<F>,
    context: Arc<ResourceContext<F>>,
    registrar: MemoryRegistrar<F>,
    table: Arc<ConnectionTable>,
    /// Transport identity to connection.
    ids: HashMap<CmId, ConnId>,
    sink: Arc<dyn ProgressSink>,
    qp_caps: QpCaps,
    message: Vec<u8>,
}

impl<F: Fabric> ConnectionManager<F> {
    pub fn new(
        fabric: Arc<F>,
        context: Arc<ResourceContext<F>>,
        registrar: MemoryRegistrar<F>,
        table: Arc<ConnectionTable>,
        sink: Arc<dyn ProgressSink>,
        qp_caps: QpCaps,
    ) -> Self {
        Self {
            fabric,
            context,
            registrar,
            table,
            ids: HashMap::new(),
            sink,
            qp_caps,
            message: outbound_message().into_bytes(),
        }
    }

    /// Live connections.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dispatch(&mut self, event: &CmEvent) -> Result<()> {
        log::debug!("on_event: {} for {} on {}", event.kind, event.id, event.endpoint);
        match event.kind {
            CmEventKind::ConnectRequest => self.on_connect_request(event),
            CmEventKind::Established => self.on_established(event.id),
            CmEventKind::Disconnected => self.on_disconnected(event.id),
            CmEventKind::Other(code) => Err(FabricError::UnknownEvent(code)),
        }
    }

    fn conn_id(&self, id: CmId) -> Result<ConnId> {
        self.ids
            .get(&id)
            .copied()
            .ok_or(FabricError::UnknownConnection(id))
    }

    fn on_connect_request(&mut self, event: &CmEvent) -> Result<()> {
        self.sink.report(Progress::ConnectRequest);
        let res = self.context.ensure(event.endpoint)?;

        let qp = self
            .fabric
            .create_qp(event.id, res.pd, &QpInitAttr::new(res.cq, self.qp_caps))?;
        let buffers = self.registrar.register(res.pd)?;

        let conn_id = self.table.next_id();
        let conn = Connection::new(conn_id, event.id, qp, buffers);
        let recv_wr = conn.recv_wr();
        self.table.insert(conn);
        self.ids.insert(event.id, conn_id);

        self.fabric.post_recv(qp, &recv_wr)?;
        self.table
            .with_mut(conn_id, |c| c.set_state(ConnState::Accepting));
        self.fabric.accept(event.id)?;
        log::info!("{}: accepting {} ({})", conn_id, event.id, qp);
        Ok(())
    }

    fn on_established(&mut self, id: CmId) -> Result<()> {
        let conn_id = self.conn_id(id)?;
        let (qp, send_wr) = self
            .table
            .with_mut(conn_id, |c| {
                c.set_state(ConnState::Established);
                // Safety: nothing has been sent on this connection yet.
                let n = unsafe { c.write_message(&self.message) };
                log::trace!("{}: {} byte message", conn_id, n);
                (c.qp(), c.send_wr())
            })
            .ok_or(FabricError::UnknownConnection(id))?;

        self.sink.report(Progress::Connected(conn_id));
        self.fabric.post_send(qp, &send_wr)?;
        log::info!("{}: established", conn_id);
        Ok(())
    }

    fn on_disconnected(&mut self, id: CmId) -> Result<()> {
        let conn_id = self.conn_id(id)?;
        self.ids.remove(&id);
        // Out of the table first: a late completion finds nothing to touch.
        let mut conn = self
            .table
            .remove(conn_id)
            .ok_or(FabricError::UnknownConnection(id))?;
        self.sink.report(Progress::Disconnected(conn_id));
        log::info!("{}: disconnected in state {:?}", conn_id, conn.state());
        conn.set_state(ConnState::Closed);

        self.fabric.destroy_qp(conn.cm_id())?;
        if let Some(buffers) = conn.take_buffers() {
            self.registrar.release(buffers)?;
        }
        drop(conn);
        self.fabric.destroy_id(id)
    }
}
