//! Error types for launching, cloning and driving channels.

use std::io;

use crate::protocol::HandshakeField;

/// Outcome of an exact-size transfer that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer closed the stream before the full buffer was transferred.
    #[error("end of stream after {transferred} of {expected} bytes")]
    EndOfStream { transferred: usize, expected: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
    /// For [`WorkerSpawner`](crate::WorkerSpawner) implementations that
    /// refuse to spawn for reasons of their own.
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("reading {field}: {source}")]
    Transfer {
        field: HandshakeField,
        #[source]
        source: TransferError,
    },

    /// The worker speaks a different protocol (or is not a worker at all).
    #[error("header mismatch: expected {expected:?}, found {found:?}")]
    HeaderMismatch { expected: String, found: String },

    #[error("worker published an empty rendezvous address")]
    EmptyAddress,
}

#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("sending token failed: {0}")]
    Token(#[source] TransferError),
}

/// Errors surfaced by [`Channel`](crate::Channel) operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to launch worker: {0}")]
    Launch(#[from] SpawnError),

    #[error("handshake with worker failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to clone channel via {address}: {source}")]
    Clone {
        address: String,
        #[source]
        source: CloneError,
    },

    #[error("channel I/O failed: {0}")]
    Io(#[from] TransferError),

    #[error("channel is closed")]
    Closed,

    #[error("failed to shut down worker: {0}")]
    Shutdown(#[source] io::Error),
}

impl ChannelError {
    /// True when the peer hung up (as opposed to a hard I/O failure).
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Io(e) if e.is_end_of_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_error_messages() {
        let eof = TransferError::EndOfStream {
            transferred: 3,
            expected: 32,
        };
        insta::assert_snapshot!(eof.to_string(), @"end of stream after 3 of 32 bytes");
        assert!(eof.is_end_of_stream());

        let io = TransferError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        assert!(!io.is_end_of_stream());
        insta::assert_snapshot!(io.to_string(), @"pipe closed");
    }

    #[test]
    fn handshake_error_nests_field() {
        let err = ChannelError::from(HandshakeError::Transfer {
            field: HandshakeField::Token,
            source: TransferError::EndOfStream {
                transferred: 0,
                expected: 32,
            },
        });
        insta::assert_snapshot!(
            err.to_string(),
            @"handshake with worker failed: reading token: end of stream after 0 of 32 bytes"
        );
    }

    #[test]
    fn end_of_stream_only_for_io_variant() {
        let eof = ChannelError::Io(TransferError::EndOfStream {
            transferred: 1,
            expected: 2,
        });
        assert!(eof.is_end_of_stream());
        assert!(!ChannelError::Closed.is_end_of_stream());
    }
}
