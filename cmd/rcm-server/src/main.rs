//! RCM passive-side server.
//!
//! Listens on a system-assigned port (or `RCM_PORT`), accepts every
//! connection, sends one message to each peer and prints whatever the peer
//! sends. Any fatal condition prints `error: <reason>` and exits 1.
//!
//! Run: RUST_LOG=debug ./target/release/rcm-server

use rcm_core::progress::{Progress, ProgressSink};
use rcm_executor::{Server, ServerConfig};
use rcm_module::SoftFabric;

use std::io::Write;
use std::sync::Arc;

/// Progress lines on stdout, flushed per line.
struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn report(&self, progress: Progress<'_>) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", progress);
        let _ = out.flush();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("off")).init();

    let config = ServerConfig::from_env();
    log::debug!("config: {:?}", config);

    let server = Server::new(Arc::new(SoftFabric::new()), config, Arc::new(StdoutSink));
    if let Err(e) = server.run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
