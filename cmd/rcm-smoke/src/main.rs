//! RCM End-to-End Smoke Test
//!
//! Runs the server over `SoftFabric` on loopback and drives it with a
//! `SoftPeer`:
//!   Part A — bootstrap: listen, report port
//!   Part B — one connection: handshake, one message each way, disconnect
//!   Part C — resources: buffers freed, regions deregistered, ids destroyed
//!
//! Run: ./target/release/rcm-smoke

use rcm_core::progress::{Progress, ProgressSink};
use rcm_executor::{outbound_message, Server, ServerConfig};
use rcm_module::soft_peer::until_nul;
use rcm_module::{SoftFabric, SoftPeer};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Forwards the port and keeps every line for later checks.
struct SmokeSink {
    port_tx: Mutex<Option<mpsc::Sender<u16>>>,
    lines: Mutex<Vec<String>>,
}

impl ProgressSink for SmokeSink {
    fn report(&self, progress: Progress<'_>) {
        if let Progress::Listening { port } = progress {
            if let Some(tx) = self.port_tx.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let _ = tx.send(port);
            }
        }
        let line = progress.to_string();
        println!("       server: {}", line);
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).push(line);
    }
}

impl SmokeSink {
    fn has_line(&self, line: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|l| l == line)
    }

    /// Poll for `line` for up to two seconds.
    fn wait_line(&self, line: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.has_line(line) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

const PEER_MESSAGE: &[u8] = b"message from active/client side\0";

// ════════════════════════════════════════════════════════════
// Part B: one connection
// ════════════════════════════════════════════════════════════

fn test_exchange(t: &mut TestRunner, sink: &SmokeSink, addr: SocketAddr) {
    t.section("Part B: Connection (handshake, exchange, disconnect)");

    let mut peer = match SoftPeer::connect(addr) {
        Ok(p) => { t.pass("connect + ACCEPT/READY handshake"); p }
        Err(e) => {
            t.fail("connect + ACCEPT/READY handshake", &e.to_string());
            return;
        }
    };
    t.check(
        "server saw connection request",
        sink.has_line("received connection request."),
        "no request line",
    );

    t.check("peer send", peer.send(PEER_MESSAGE).is_ok(), "write failed");
    match peer.recv() {
        Ok(Some(reply)) => {
            t.check("reply covers whole buffer", reply.len() == 1024, &format!("{} bytes", reply.len()));
            t.check(
                "reply text",
                until_nul(&reply) == outbound_message().as_bytes(),
                &String::from_utf8_lossy(until_nul(&reply)),
            );
        }
        Ok(None) => t.fail("peer recv", "server closed"),
        Err(e) => t.fail("peer recv", &e.to_string()),
    }

    let expected = format!(
        "received message: {}",
        String::from_utf8_lossy(until_nul(PEER_MESSAGE))
    );
    t.check("server received message", sink.wait_line(&expected), "no receive line");
    t.check(
        "send completion",
        sink.wait_line("send completed successfully."),
        "no completion line",
    );

    t.check("peer disconnect", peer.disconnect().is_ok(), "shutdown failed");
    t.check("server saw disconnect", sink.wait_line("peer disconnected."), "no disconnect line");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    println!("=== RCM End-to-End Smoke Test ===");

    let mut t = TestRunner::new();
    let (port_tx, port_rx) = mpsc::channel();
    let sink = Arc::new(SmokeSink {
        port_tx: Mutex::new(Some(port_tx)),
        lines: Mutex::new(Vec::new()),
    });

    let fabric = Arc::new(SoftFabric::new());
    let config = ServerConfig::default().bind_ip(Ipv4Addr::LOCALHOST.into());
    let server = Server::new(Arc::clone(&fabric), config, sink.clone());
    let supervisor = server.supervisor();
    let stats = server.buffer_stats();
    let running = thread::spawn(move || server.run());

    // Part A
    t.section("Part A: Bootstrap");
    let port = match port_rx.recv_timeout(Duration::from_secs(2)) {
        Ok(port) => { t.pass(&format!("listening on port {}", port)); port }
        Err(_) => {
            t.fail("listen", "server never reported a port");
            supervisor.finish();
            let _ = running.join();
            t.summary();
            std::process::exit(1);
        }
    };

    // Part B
    test_exchange(&mut t, &sink, SocketAddr::from((Ipv4Addr::LOCALHOST, port)));

    // Part C
    t.section("Part C: Resources");
    supervisor.finish();
    match running.join() {
        Ok(Ok(())) => t.pass("server stopped cleanly"),
        Ok(Err(e)) => t.fail("server stopped cleanly", &e.to_string()),
        Err(_) => t.fail("server stopped cleanly", "server thread panicked"),
    }
    t.check(
        "buffers freed",
        stats.live_buffers() == 0,
        &format!("{} live", stats.live_buffers()),
    );
    t.check(
        "registrations balanced",
        stats.registered() == stats.deregistered() && fabric.registered_regions() == 0,
        &format!("{} reg / {} dereg", stats.registered(), stats.deregistered()),
    );
    t.check("identities destroyed", fabric.live_ids() == 0, &format!("{} live", fabric.live_ids()));
    t.check("events acknowledged", fabric.unacked_events() == 0, "unacked events");

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
