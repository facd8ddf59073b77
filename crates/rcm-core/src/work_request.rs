//! Work requests, memory regions and queue pair attributes.
//!
//! These mirror the verbs structures but are plain Rust values. Buffer
//! addresses travel as `u64` exactly like they would in an SGE.

use crate::handle::{ConnId, CqHandle};

/// Memory region access flags.
pub mod access {
    pub const LOCAL_WRITE: u32 = 1 << 0;
    pub const REMOTE_WRITE: u32 = 1 << 1;
    pub const REMOTE_READ: u32 = 1 << 2;
}

/// Raw memory handed to `VerbsProvider::reg_mr`.
#[derive(Debug, Clone, Copy)]
pub struct RawRegion {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: a region is just pointer + length; validity is the registrant's
// contract (see `VerbsProvider::reg_mr`).
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Local key, quoted in every SGE that references this region.
    pub lkey: u32,
    pub rkey: u32,
    pub addr: u64,
    pub length: usize,
    pub access: u32,
}

impl MemoryRegion {
    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: u32) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len as u64)
                .map_or(false, |end| end <= self.addr + self.length as u64)
    }

    /// An SGE covering the first `length` bytes of the region.
    pub fn sge(&self, length: u32) -> Sge {
        Sge {
            addr: self.addr,
            length,
            lkey: self.lkey,
        }
    }
}

/// Scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Receive work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: ConnId,
    pub sge: Sge,
}

/// Send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: ConnId,
    pub sge: Sge,
    /// Generate a completion when done.
    pub signaled: bool,
}

/// Queue depth and scatter/gather limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Reliable-connected queue pair attributes. Both work queues report to
/// the same completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub cap: QpCaps,
}

impl QpInitAttr {
    pub fn new(cq: CqHandle, cap: QpCaps) -> Self {
        Self {
            send_cq: cq,
            recv_cq: cq,
            cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> MemoryRegion {
        MemoryRegion {
            lkey: 7,
            rkey: 8,
            addr: 0x1000,
            length: 1024,
            access: access::LOCAL_WRITE | access::REMOTE_WRITE,
        }
    }

    #[test]
    fn test_region_contains() {
        let mr = region();
        assert!(mr.contains(0x1000, 1024));
        assert!(mr.contains(0x1100, 16));
        assert!(!mr.contains(0x1000, 1025));
        assert!(!mr.contains(0x0fff, 1));
        assert!(!mr.contains(u64::MAX, 2));
    }

    #[test]
    fn test_region_sge() {
        let sge = region().sge(1024);
        assert_eq!(sge, Sge { addr: 0x1000, length: 1024, lkey: 7 });
    }

    #[test]
    fn test_qp_attr_shares_cq() {
        let attr = QpInitAttr::new(CqHandle(2), QpCaps::default());
        assert_eq!(attr.send_cq, attr.recv_cq);
        assert_eq!(attr.cap.max_recv_sge, 1);
        assert_eq!(attr.cap.max_send_wr, 10);
    }
}
