//! rendezvous-worker: the worker half of the rendezvous protocol.
//!
//! A worker publishes a handshake on stdout, serves its root context on
//! stdin/stdout, and runs one more context per authenticated clone
//! connection until the controller closes the root channel.

pub mod echo;
pub mod logging;
pub mod server;
pub mod stdio;

pub use echo::Echo;
pub use logging::init_tracing;
pub use server::{
    BoxReader, BoxWriter, ContextHandler, ContextId, Worker, WorkerConfig, WorkerError, serve,
};
