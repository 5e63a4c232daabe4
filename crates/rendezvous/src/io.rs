//! Exact-size blocking transfers.
//!
//! `std::io::Read::read_exact` folds a short stream into an `UnexpectedEof`
//! error and loses how far it got. The channel protocol needs to tell a peer
//! that hung up apart from a broken descriptor, so these loop by hand.

use std::io::{self, Read, Write};

use crate::error::TransferError;

/// Read exactly `buf.len()` bytes.
///
/// Short reads are retried until the buffer is full. `Interrupted` is retried
/// transparently. A zero-length read before the buffer is full is reported as
/// [`TransferError::EndOfStream`].
pub fn transfer_read<R: Read + ?Sized>(endpoint: &mut R, buf: &mut [u8]) -> Result<(), TransferError> {
    let expected = buf.len();
    let mut progress = 0;
    while progress < expected {
        match endpoint.read(&mut buf[progress..]) {
            Ok(0) => {
                return Err(TransferError::EndOfStream {
                    transferred: progress,
                    expected,
                });
            }
            Ok(n) => progress += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        }
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes.
///
/// A write that makes no progress is reported as
/// [`TransferError::EndOfStream`].
pub fn transfer_write<W: Write + ?Sized>(endpoint: &mut W, buf: &[u8]) -> Result<(), TransferError> {
    let expected = buf.len();
    let mut progress = 0;
    while progress < expected {
        match endpoint.write(&buf[progress..]) {
            Ok(0) => {
                return Err(TransferError::EndOfStream {
                    transferred: progress,
                    expected,
                });
            }
            Ok(n) => progress += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        }
    }
    Ok(())
}
