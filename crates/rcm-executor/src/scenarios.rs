//! End-to-end runs of `Server` against scripted and soft fabrics.

use crate::config::ServerConfig;
use crate::server::Server;

use rcm_core::completion::{WcOpcode, WcStatus, WorkCompletion};
use rcm_core::error::{ErrorKind, FabricError, Result};
use rcm_core::event::CmEventKind;
use rcm_core::handle::{CmId, ConnId, EndpointId};
use rcm_core::progress::{Progress, ProgressSink};
use rcm_core::work_request::access;
use rcm_module::{Call, MockFabric, SoftFabric, SoftPeer};

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// Records progress lines and raw received messages.
#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
    messages: Mutex<Vec<Vec<u8>>>,
    cv: Condvar,
}

impl ProgressSink for Recorder {
    fn report(&self, progress: Progress<'_>) {
        if let Progress::Received { message, .. } = progress {
            self.messages.lock().unwrap().push(message.to_vec());
        }
        self.lines.lock().unwrap().push(progress.to_string());
        self.cv.notify_all();
    }
}

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn wait_for(&self, line: &str) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut lines = self.lines.lock().unwrap();
        loop {
            if lines.iter().any(|l| l == line) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lines = self.cv.wait_timeout(lines, deadline - now).unwrap().0;
        }
    }
}

struct Harness {
    fabric: Arc<MockFabric>,
    recorder: Arc<Recorder>,
    server: Option<JoinHandle<Result<()>>>,
    table: Arc<crate::ConnectionTable>,
    stats: Arc<crate::RegistrarStats>,
}

impl Harness {
    fn start() -> Self {
        let fabric = Arc::new(MockFabric::new());
        let recorder = Arc::new(Recorder::default());
        let server = Server::new(Arc::clone(&fabric), ServerConfig::default(), recorder.clone());
        let table = server.connections();
        let stats = server.buffer_stats();
        let server = thread::spawn(move || server.run());
        Self {
            fabric,
            recorder,
            server: Some(server),
            table,
            stats,
        }
    }

    fn wait_call(&self, call: Call) {
        assert!(
            self.fabric.wait_for_call(WAIT, |c| *c == call),
            "timed out waiting for {:?}",
            call
        );
    }

    fn connect(&self, id: CmId) {
        self.fabric.push_event(CmEventKind::ConnectRequest, id);
        self.wait_call(Call::Accept(id));
    }

    fn join(&mut self) -> Result<()> {
        self.server.take().unwrap().join().unwrap()
    }

    fn stop(&mut self) -> Result<()> {
        self.fabric.close_events();
        self.join()
    }

    fn position(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.fabric
            .calls()
            .iter()
            .position(pred)
            .expect("call not journaled")
    }
}

// A: connection request → one receive posted, then accept.
#[test]
fn test_connect_request_posts_receive_before_accept() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.stop().unwrap();

    let calls = h.fabric.calls();
    let recvs: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::PostRecv { wr, .. } => Some(*wr),
            _ => None,
        })
        .collect();
    assert_eq!(recvs.len(), 1);
    assert_eq!(recvs[0].sge.length, 1024);

    let recv_at = h.position(|c| matches!(c, Call::PostRecv { .. }));
    let accept_at = h.position(|c| *c == Call::Accept(CmId(1)));
    let qp_at = h.position(|c| matches!(c, Call::CreateQp { id: CmId(1), .. }));
    let mr_at = h.position(|c| matches!(c, Call::RegMr { .. }));
    assert!(qp_at < mr_at && mr_at < recv_at && recv_at < accept_at);

    let regs: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, Call::RegMr { .. }))
        .collect();
    assert_eq!(regs.len(), 2);
    for reg in regs {
        assert!(matches!(
            reg,
            Call::RegMr { len: 1024, access: a, .. } if *a == access::LOCAL_WRITE | access::REMOTE_WRITE
        ));
    }
    assert_eq!(h.fabric.unacked_events(), 0);
    assert_eq!(
        h.recorder.lines()[..2],
        ["listening on port 20079.", "received connection request."]
    );
}

// B: established → exactly one signaled send carrying the message.
#[test]
fn test_established_posts_one_signaled_send() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric.push_event(CmEventKind::Established, CmId(1));
    assert!(h.recorder.wait_for("send completed successfully."));
    h.stop().unwrap();

    let sends: Vec<_> = h
        .fabric
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::PostSend { wr, .. } => Some(wr),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].signaled);
    assert_eq!(sends[0].sge.length, 1024);

    let sent = h.fabric.sent();
    assert_eq!(sent.len(), 1);
    let (id, bytes) = &sent[0];
    assert_eq!(*id, CmId(1));
    assert!(bytes.len() <= 1024);
    let text_len = bytes.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&bytes[..text_len], crate::outbound_message().as_bytes());

    let lines = h.recorder.lines();
    let connected = lines.iter().position(|l| l == "connected. posting send...").unwrap();
    let completed = lines.iter().position(|l| l == "send completed successfully.").unwrap();
    assert!(connected < completed);
}

// C: a receive completion is read and bounded to the buffer.
#[test]
fn test_receive_is_bounded_to_buffer() {
    let mut h = Harness::start();
    h.connect(CmId(1));

    // Fills the whole buffer, no terminator.
    assert!(h.fabric.deliver_recv(CmId(1), &[b'x'; 1024]));
    let expected = format!("received message: {}", "x".repeat(1024));
    assert!(h.recorder.wait_for(&expected));
    h.stop().unwrap();

    let messages = h.recorder.messages.lock().unwrap().clone();
    assert_eq!(messages, vec![vec![b'x'; 1024]]);
}

#[test]
fn test_receive_stops_at_nul() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    assert!(h.fabric.deliver_recv(CmId(1), b"hello\0trailing"));
    assert!(h.recorder.wait_for("received message: hello"));
    h.stop().unwrap();
}

// D: disconnect releases everything in order.
#[test]
fn test_disconnect_tears_down_in_order() {
    let mut h = Harness::start();
    // (call, buffers allocated, connections alive, still in table)
    let seen: Arc<Mutex<Vec<(Call, usize, usize, bool)>>> = Arc::default();
    {
        let table = Arc::clone(&h.table);
        let stats = Arc::clone(&h.stats);
        let seen = Arc::clone(&seen);
        h.fabric.set_teardown_hook(move |call| {
            let in_table = !table.is_empty();
            seen.lock()
                .unwrap()
                .push((call.clone(), stats.live_buffers(), table.live(), in_table));
        });
    }

    h.connect(CmId(1));
    h.fabric.push_event(CmEventKind::Established, CmId(1));
    assert!(h.recorder.wait_for("send completed successfully."));
    h.fabric.push_event(CmEventKind::Disconnected, CmId(1));
    h.wait_call(Call::DestroyId(CmId(1)));
    h.stop().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 4, "{:?}", seen);

    // Queue pair first; the connection and both buffers still exist.
    assert_eq!(seen[0], (Call::DestroyQp(CmId(1)), 2, 1, false));
    // Both regions deregistered before any buffer is freed, connection alive.
    for (call, buffers, live, _) in &seen[1..3] {
        assert!(matches!(call, Call::DeregMr { .. }), "{:?}", call);
        assert_eq!(*buffers, 2, "buffer freed before {:?}", call);
        assert_eq!(*live, 1, "connection dropped before {:?}", call);
    }
    // Identity last: buffers freed and connection dropped.
    assert_eq!(seen[3], (Call::DestroyId(CmId(1)), 0, 0, false));

    assert_eq!(h.fabric.reg_count(), h.fabric.dereg_count());
    assert_eq!(h.stats.live_buffers(), 0);
    assert!(h.recorder.lines().contains(&"peer disconnected.".to_string()));
}

#[test]
fn test_disconnect_before_any_completion() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric.push_event(CmEventKind::Disconnected, CmId(1));
    h.wait_call(Call::DestroyId(CmId(1)));
    h.stop().unwrap();
    assert_eq!(h.fabric.reg_count(), 2);
    assert_eq!(h.fabric.dereg_count(), 2);
    assert!(h.table.is_empty());
}

// E: a failed completion stops everything with an error.
#[test]
fn test_failed_completion_is_fatal() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric.set_send_status(Some(WcStatus::RetryExceeded));
    h.fabric.push_event(CmEventKind::Established, CmId(1));

    let err = h.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert!(matches!(
        err,
        FabricError::CompletionStatus {
            opcode: WcOpcode::Send,
            status: WcStatus::RetryExceeded,
            ..
        }
    ));

    // Nothing more is taken off the channel.
    h.fabric.push_event(CmEventKind::ConnectRequest, CmId(2));
    assert_eq!(h.fabric.pending_events(), 1);
    assert!(!h
        .fabric
        .calls()
        .iter()
        .any(|c| matches!(c, Call::CreateQp { id: CmId(2), .. })));
}

#[test]
fn test_oversized_receive_is_fatal() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    assert!(h.fabric.deliver_recv(CmId(1), &[0u8; 2048]));
    let err = h.join().unwrap_err();
    assert!(matches!(
        err,
        FabricError::CompletionStatus { status: WcStatus::LocalLength, .. }
    ));
}

// F: an unknown event kind is fatal.
#[test]
fn test_unknown_event_is_fatal() {
    let mut h = Harness::start();
    h.fabric.push_event(CmEventKind::Other(13), CmId(1));
    let err = h.join().unwrap_err();
    assert!(matches!(err, FabricError::UnknownEvent(13)));
    assert_eq!(err.to_string(), "on_event: unknown event 13");
}

#[test]
fn test_second_endpoint_is_fatal() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric
        .push_event_on(CmEventKind::ConnectRequest, CmId(2), EndpointId(1));
    let err = h.join().unwrap_err();
    assert!(matches!(err, FabricError::EndpointMismatch { .. }));
    let pds = h
        .fabric
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::AllocPd(_)))
        .count();
    assert_eq!(pds, 1);
}

#[test]
fn test_context_shared_by_connections() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.connect(CmId(2));
    h.stop().unwrap();
    let calls = h.fabric.calls();
    assert_eq!(calls.iter().filter(|c| matches!(c, Call::AllocPd(_))).count(), 1);
    assert_eq!(calls.iter().filter(|c| matches!(c, Call::CreateCq { .. })).count(), 1);
    assert_eq!(calls.iter().filter(|c| matches!(c, Call::Accept(_))).count(), 2);
}

#[test]
fn test_poller_acks_one_then_rearms() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric.push_event(CmEventKind::Established, CmId(1));
    assert!(h.recorder.wait_for("send completed successfully."));
    h.stop().unwrap();

    let calls = h.fabric.calls();
    let ack_at = calls
        .iter()
        .position(|c| matches!(c, Call::AckCqEvents { n: 1, .. }))
        .unwrap();
    assert!(calls[ack_at + 1..]
        .iter()
        .any(|c| matches!(c, Call::ReqNotifyCq(_))));
}

#[test]
fn test_late_completion_after_teardown_is_ignored() {
    let mut h = Harness::start();
    h.connect(CmId(1));
    h.fabric.push_event(CmEventKind::Disconnected, CmId(1));
    h.wait_call(Call::DestroyId(CmId(1)));
    h.fabric
        .push_completion(WorkCompletion::success(ConnId(1), WcOpcode::Recv, 8));
    h.stop().unwrap();
}

#[test]
fn test_resource_failure_is_fatal() {
    let mut h = Harness::start();
    h.fabric.fail_on("ibv_post_recv", "queue full");
    h.fabric.push_event(CmEventKind::ConnectRequest, CmId(1));
    let err = h.join().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceCall);
    assert!(!h.fabric.calls().contains(&Call::Accept(CmId(1))));
}

/// `Server` over a loopback `SoftFabric`, already listening.
struct SoftServer {
    fabric: Arc<SoftFabric>,
    recorder: Arc<Recorder>,
    supervisor: Arc<crate::Supervisor>,
    stats: Arc<crate::RegistrarStats>,
    running: JoinHandle<Result<()>>,
    port: u16,
}

impl SoftServer {
    fn start() -> Self {
        let fabric = Arc::new(SoftFabric::new());
        let recorder = Arc::new(Recorder::default());
        let config = ServerConfig::default().bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let server = Server::new(Arc::clone(&fabric), config, recorder.clone());
        let supervisor = server.supervisor();
        let stats = server.buffer_stats();
        let running = thread::spawn(move || server.run());

        let deadline = Instant::now() + WAIT;
        let port = loop {
            let found = recorder.lines().iter().find_map(|l| {
                l.strip_prefix("listening on port ")?
                    .strip_suffix('.')?
                    .parse::<u16>()
                    .ok()
            });
            if let Some(port) = found {
                break port;
            }
            assert!(Instant::now() < deadline, "server never listened");
            thread::sleep(Duration::from_millis(5));
        };
        Self { fabric, recorder, supervisor, stats, running, port }
    }

    fn addr(&self) -> std::net::SocketAddr {
        (Ipv4Addr::LOCALHOST, self.port).into()
    }

    /// Stop cleanly and check nothing leaked.
    fn finish(self) {
        self.supervisor.finish();
        self.running.join().unwrap().unwrap();
        assert_eq!(self.stats.live_buffers(), 0);
        assert_eq!(self.fabric.registered_regions(), 0);
        assert_eq!(self.fabric.live_ids(), 0);
    }
}

#[test]
fn test_soft_fabric_exchange() {
    let srv = SoftServer::start();

    let mut peer = SoftPeer::connect(srv.addr()).unwrap();
    peer.send(b"message from active/client side\0").unwrap();
    let reply = peer.recv().unwrap().unwrap();
    assert_eq!(reply.len(), 1024);
    assert_eq!(
        rcm_module::soft_peer::until_nul(&reply),
        crate::outbound_message().as_bytes()
    );
    assert!(srv.recorder.wait_for("received message: message from active/client side"));
    assert!(srv.recorder.wait_for("send completed successfully."));
    peer.disconnect().unwrap();
    assert!(srv.recorder.wait_for("peer disconnected."));

    srv.finish();
}

// A peer that connects and leaves before the accept must not stop the server.
#[test]
fn test_peer_gone_before_accept() {
    let srv = SoftServer::start();

    drop(TcpStream::connect(srv.addr()).unwrap());
    assert!(srv.recorder.wait_for("received connection request."));
    assert!(srv.recorder.wait_for("peer disconnected."));

    // Still serving.
    let mut peer = SoftPeer::connect(srv.addr()).unwrap();
    assert!(peer.recv().unwrap().is_some());
    peer.disconnect().unwrap();
    assert!(srv.recorder.wait_for("send completed successfully."));
    let disconnects = || {
        srv.recorder
            .lines()
            .iter()
            .filter(|l| *l == "peer disconnected.")
            .count()
    };
    let deadline = Instant::now() + WAIT;
    while disconnects() < 2 {
        assert!(Instant::now() < deadline, "second disconnect never seen");
        thread::sleep(Duration::from_millis(5));
    }

    srv.finish();
}
