use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, NetclError>;

#[derive(Debug, thiserror::Error)]
pub enum NetclError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to bind UDP socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("send to device failed on thread {thread_id}: {source}")]
    Send {
        thread_id: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("receive failed on thread {thread_id}: {source}")]
    Recv {
        thread_id: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("datagram too short for NetCL header: {len} < {expected}")]
    TruncatedPacket { len: usize, expected: usize },

    #[error("worker thread {thread_id} panicked")]
    ThreadPanicked { thread_id: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetclError {
    /// Create an `InvalidConfig` error from anything printable.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let e = NetclError::config("zero threads");
        assert_eq!(e.to_string(), "invalid configuration: zero threads");
    }

    #[test]
    fn test_truncated_packet_display() {
        let e = NetclError::TruncatedPacket {
            len: 10,
            expected: 25,
        };
        assert_eq!(e.to_string(), "datagram too short for NetCL header: 10 < 25");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let err: NetclError = io_err.into();
        assert!(err.to_string().contains("port busy"));
    }

    #[test]
    fn test_all_variants_display() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let errors: Vec<NetclError> = vec![
            NetclError::config("x"),
            NetclError::Bind {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy"),
            },
            NetclError::Send {
                thread_id: 1,
                source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
            },
            NetclError::Recv {
                thread_id: 2,
                source: std::io::Error::new(std::io::ErrorKind::Other, "x"),
            },
            NetclError::TruncatedPacket {
                len: 0,
                expected: 25,
            },
            NetclError::ThreadPanicked { thread_id: 3 },
            NetclError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
