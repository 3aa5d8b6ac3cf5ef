use std::io;

use thiserror::Error;

use crate::exposehost::tunnel::codec::ProtocolError;

/// Failures of the tunnel core.
///
/// Only [`TunnelError::Protocol`] and [`TunnelError::ConnectionClosed`] end a control
/// connection on their own; the rest are contained to one pairing or escalated by the
/// caller into a session teardown.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("subdomain already in use: {0}")]
    SubdomainConflict(String),
    #[error("host did not call back for connection {0}")]
    CallbackTimeout(String),
    #[error("no pairing awaits connection {0}")]
    UnknownConnection(String),
    #[error("relay: {0}")]
    RelayIo(#[source] io::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Maps an I/O error to [`TunnelError::ConnectionClosed`] when it means the peer is gone.
    pub fn from_stream_io(err: io::Error) -> Self {
        if is_peer_gone(&err) {
            TunnelError::ConnectionClosed
        } else {
            TunnelError::Io(err)
        }
    }
}

pub fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_and_reset_mean_closed() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = TunnelError::from_stream_io(io::Error::from(kind));
            assert!(matches!(err, TunnelError::ConnectionClosed), "{kind:?}");
        }
        let err = TunnelError::from_stream_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
