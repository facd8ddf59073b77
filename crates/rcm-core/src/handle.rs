//! Typed handles.
//!
//! Every fabric object is referenced by a small copyable handle instead of
//! a raw pointer. Providers own the objects; the executor only ever holds
//! handles.

use core::fmt;

macro_rules! fabric_handle {
    ($(#[$meta:meta])* $name:ident($repr:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub $repr);

        impl $name {
            /// Get the raw value
            #[inline]
            pub const fn raw(self) -> $repr {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }
    };
}

fabric_handle!(
    /// Identifies the physical fabric endpoint (device) a resource context
    /// is bound to.
    EndpointId(u32),
    "ep"
);

fabric_handle!(
    /// Transport identity of one peer session on the connection-management
    /// channel. The listener has one as well.
    CmId(u64),
    "cm"
);

fabric_handle!(
    /// Protection domain.
    PdHandle(u32),
    "pd"
);

fabric_handle!(
    /// Completion queue.
    CqHandle(u32),
    "cq"
);

fabric_handle!(
    /// Completion notification channel.
    ChannelHandle(u32),
    "chan"
);

fabric_handle!(
    /// Queue pair.
    QpHandle(u32),
    "qp"
);

/// Connection handle carried as `wr_id` on every work request.
///
/// Maps 1:1 to an entry in the executor's connection table. The completion
/// handler resolves it back to the connection; nothing is ever cast.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Sentinel value indicating no connection
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "conn#NONE")
        } else {
            write!(f, "conn#{}", self.0)
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(EndpointId(0).to_string(), "ep#0");
        assert_eq!(CmId(7).to_string(), "cm#7");
        assert_eq!(format!("{:?}", QpHandle(3)), "qp#3");
        assert_eq!(ConnId::new(5).to_string(), "conn#5");
        assert_eq!(ConnId::NONE.to_string(), "conn#NONE");
    }

    #[test]
    fn test_conn_id_sentinel() {
        assert!(ConnId::NONE.is_none());
        assert!(!ConnId::new(0).is_none());
        assert_eq!(ConnId::new(42).as_u64(), 42);
    }
}
