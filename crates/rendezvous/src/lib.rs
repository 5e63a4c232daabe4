//! rendezvous: launch a worker over pipes and clone more channels into it.
//!
//! Flow:
//! 1. [`launch`] spawns the worker with piped stdio and reads the handshake
//!    (header, rendezvous address, token)
//! 2. [`Channel::clone_channel`] connects to the address and presents the
//!    token, giving a new independent context in the same worker
//! 3. [`Channel::close`] tears a channel down; on the top-level channel that
//!    ends the worker and every clone

#[cfg(not(unix))]
compile_error!("rendezvous requires Unix domain sockets");

mod channel;
mod clone;
pub mod error;
pub mod io;
pub mod launch;
pub mod protocol;

pub use channel::{Channel, ChannelKind};
pub use clone::clone_channel;
pub use error::{ChannelError, CloneError, HandshakeError, SpawnError, TransferError};
pub use launch::{CommandSpawner, LaunchConfig, StderrMode, WorkerSpawner, launch, launch_with};
pub use protocol::{Rendezvous, RendezvousAddress, Token};
