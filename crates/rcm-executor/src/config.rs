//! Server configuration.

use rcm_core::env::env_get;
use rcm_core::work_request::QpCaps;

use std::net::{IpAddr, SocketAddr};

/// Tunables for one server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listening port. 0 lets the system pick one.
    pub port: u16,
    pub bind_ip: IpAddr,
    pub backlog: u32,
    /// Completion queue depth, fixed at creation.
    pub cq_depth: u32,
    /// Size of each per-connection send and receive buffer.
    pub buffer_size: usize,
    pub qp_caps: QpCaps,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "ipv6")] {
        /// Unspecified address of the family picked at build time.
        pub fn default_bind_ip() -> IpAddr {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }
    } else {
        /// Unspecified address of the family picked at build time.
        pub fn default_bind_ip() -> IpAddr {
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_ip: default_bind_ip(),
            backlog: 10,
            cq_depth: 10,
            buffer_size: 1024,
            qp_caps: QpCaps::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `RCM_PORT`, `RCM_BACKLOG`, `RCM_CQ_DEPTH`
    /// and `RCM_BUFFER_SIZE`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            port: env_get("RCM_PORT", d.port),
            backlog: env_get("RCM_BACKLOG", d.backlog),
            cq_depth: env_get("RCM_CQ_DEPTH", d.cq_depth),
            buffer_size: env_get("RCM_BUFFER_SIZE", d.buffer_size),
            ..d
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn backlog(mut self, n: u32) -> Self {
        self.backlog = n;
        self
    }

    pub fn cq_depth(mut self, n: u32) -> Self {
        self.cq_depth = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn qp_caps(mut self, caps: QpCaps) -> Self {
        self.qp_caps = caps;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}
