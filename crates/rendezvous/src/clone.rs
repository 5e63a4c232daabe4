//! Open another execution context in a running worker.
//!
//! A clone is one Unix socket connection to the worker's rendezvous address,
//! authenticated by writing the token as the first 32 bytes. The worker
//! spawns a fresh context per accepted connection; no process is created.

use std::os::unix::net::UnixStream;

use crate::channel::Channel;
use crate::error::{ChannelError, CloneError};
use crate::io::transfer_write;
use crate::protocol::Rendezvous;

/// Connect to `rendezvous` and present its token.
///
/// Failure is an explicit [`ChannelError::Clone`]; nothing half-open is
/// returned.
pub fn clone_channel(rendezvous: &Rendezvous) -> Result<Channel, ChannelError> {
    let address = rendezvous.address;
    let clone_err = |source| ChannelError::Clone {
        address: address.to_string(),
        source,
    };

    tracing::trace!(%address, "Connecting clone");
    let mut stream =
        UnixStream::connect(address.path()).map_err(|e| clone_err(CloneError::Connect(e)))?;

    transfer_write(&mut stream, rendezvous.token.as_bytes())
        .map_err(|e| clone_err(CloneError::Token(e)))?;

    tracing::debug!(%address, "Cloned channel");
    Ok(Channel::cloned(rendezvous.clone(), stream))
}

impl Channel {
    /// Open a new, independent channel into the same worker.
    ///
    /// Works on a closed channel too: only the rendezvous is needed.
    pub fn clone_channel(&self) -> Result<Channel, ChannelError> {
        clone_channel(self.rendezvous())
    }
}
