//! Channel handle and its lifecycle.
//!
//! A channel is one byte stream to one execution context inside a worker.
//! The top-level channel rides on the worker's stdin/stdout pipes and owns
//! the worker process; cloned channels ride on one Unix socket each.
//!
//! Closing drops the descriptors and leaves both sides absent. Closing the
//! top-level channel additionally waits for the worker to exit (escalating to
//! signals after the grace period), which ends every cloned context too.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::ChannelError;
use crate::io::{transfer_read, transfer_write};
use crate::protocol::{Rendezvous, RendezvousAddress, Token};

/// How long a worker gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Created by launch; owns the worker process.
    TopLevel,
    /// Created by cloning; owns one socket connection.
    Cloned,
}

enum Endpoint {
    Pipes {
        reader: ChildStdout,
        writer: ChildStdin,
    },
    /// One bidirectional descriptor serves as both sides.
    Socket(UnixStream),
}

impl Endpoint {
    fn read_side(&self) -> BorrowedFd<'_> {
        match self {
            Self::Pipes { reader, .. } => reader.as_fd(),
            Self::Socket(stream) => stream.as_fd(),
        }
    }

    fn write_side(&self) -> BorrowedFd<'_> {
        match self {
            Self::Pipes { writer, .. } => writer.as_fd(),
            Self::Socket(stream) => stream.as_fd(),
        }
    }

    fn reader(&mut self) -> &mut dyn Read {
        match self {
            Self::Pipes { reader, .. } => reader,
            Self::Socket(stream) => stream,
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Pipes { writer, .. } => writer,
            Self::Socket(stream) => stream,
        }
    }

    /// Read side first, then the write side if it is a separate descriptor.
    fn close(self) {
        match self {
            Self::Pipes { reader, writer } => {
                drop(reader);
                drop(writer);
            }
            Self::Socket(stream) => drop(stream),
        }
    }
}

struct WorkerProcess {
    child: Child,
    grace: Duration,
}

impl WorkerProcess {
    /// Wait for the worker to exit after its stdin closed, escalating to
    /// SIGTERM and then SIGKILL.
    fn shutdown(mut self) -> io::Result<ExitStatus> {
        let pid = self.child.id();

        // A grace too large to represent as a deadline means no deadline.
        let Some(deadline) = Instant::now().checked_add(self.grace) else {
            return self.child.wait();
        };
        if let Some(status) = self.wait_until(deadline)? {
            return Ok(status);
        }

        tracing::warn!(pid, grace = ?self.grace, "Worker still running after close, sending SIGTERM");
        if let Ok(raw) = i32::try_from(pid)
            && let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM)
        {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
        if let Some(status) = self.wait_until(Instant::now() + TERM_GRACE)? {
            return Ok(status);
        }

        tracing::warn!(pid, "Worker ignored SIGTERM, killing");
        self.child.kill()?;
        self.child.wait()
    }

    fn wait_until(&mut self, deadline: Instant) -> io::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Handle to one execution context inside a worker.
///
/// Descriptors are owned exclusively by this value. `rendezvous()` stays
/// valid after `close`, so a closed channel can still be cloned from.
pub struct Channel {
    rendezvous: Rendezvous,
    kind: ChannelKind,
    endpoint: Option<Endpoint>,
    worker: Option<WorkerProcess>,
}

impl Channel {
    pub(crate) fn top_level(
        rendezvous: Rendezvous,
        reader: ChildStdout,
        writer: ChildStdin,
        child: Child,
        grace: Duration,
    ) -> Self {
        Self {
            rendezvous,
            kind: ChannelKind::TopLevel,
            endpoint: Some(Endpoint::Pipes { reader, writer }),
            worker: Some(WorkerProcess { child, grace }),
        }
    }

    pub(crate) fn cloned(rendezvous: Rendezvous, stream: UnixStream) -> Self {
        Self {
            rendezvous,
            kind: ChannelKind::Cloned,
            endpoint: Some(Endpoint::Socket(stream)),
            worker: None,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn address(&self) -> &RendezvousAddress {
        &self.rendezvous.address
    }

    pub fn token(&self) -> &Token {
        &self.rendezvous.token
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Worker process id; only the top-level channel knows it.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.child.id())
    }

    /// Descriptor to read application bytes from, or `None` once closed.
    pub fn read_side(&self) -> Option<BorrowedFd<'_>> {
        self.endpoint.as_ref().map(Endpoint::read_side)
    }

    /// Descriptor to write application bytes to, or `None` once closed.
    /// Same descriptor as [`read_side`](Self::read_side) for cloned channels.
    pub fn write_side(&self) -> Option<BorrowedFd<'_>> {
        self.endpoint.as_ref().map(Endpoint::write_side)
    }

    /// Fill `buf` completely from the channel.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let endpoint = self.endpoint.as_mut().ok_or(ChannelError::Closed)?;
        Ok(transfer_read(endpoint.reader(), buf)?)
    }

    /// Write all of `buf` to the channel.
    pub fn write_full(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let endpoint = self.endpoint.as_mut().ok_or(ChannelError::Closed)?;
        Ok(transfer_write(endpoint.writer(), buf)?)
    }

    /// Wait up to `timeout` for the read side to become readable (data or
    /// hang-up). Returns `false` if the deadline passed first. A timeout too
    /// large to represent as a deadline waits indefinitely.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool, ChannelError> {
        let fd = self.read_side().ok_or(ChannelError::Closed)?;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // poll(2) takes an i32 of milliseconds; longer waits go round again.
            let (poll_timeout, clamped) = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match i32::try_from(remaining.as_millis()) {
                        Ok(millis) => (
                            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX),
                            false,
                        ),
                        Err(_) => (PollTimeout::MAX, true),
                    }
                }
                None => (PollTimeout::NONE, false),
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout) {
                Ok(0) if clamped => continue,
                Ok(n) => return Ok(n > 0),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::Io(io::Error::from(e).into())),
            }
        }
    }

    /// Close both sides. Idempotent.
    ///
    /// On the top-level channel this also waits for the worker to exit,
    /// which tears down every context cloned from it. On a cloned channel
    /// only that one context ends.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(endpoint) = self.endpoint.take() {
            tracing::trace!(kind = ?self.kind, address = %self.rendezvous.address, "Closing channel");
            endpoint.close();
        }

        if let Some(worker) = self.worker.take() {
            let pid = worker.child.id();
            let status = worker.shutdown().map_err(ChannelError::Shutdown)?;
            tracing::debug!(pid, %status, "Worker exited");
        }
        Ok(())
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.reader().read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed")),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.writer().write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "channel is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.writer().flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close channel");
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("address", &self.rendezvous.address)
            .field("open", &self.is_open())
            .field("worker_pid", &self.worker_pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::process::{Command, Stdio};

    fn rendezvous() -> Rendezvous {
        Rendezvous::new(
            RendezvousAddress::from_path("/tmp/rv-channel-test").unwrap(),
            Token::from_bytes([7u8; 32]),
        )
    }

    fn socket_channel() -> (Channel, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Channel::cloned(rendezvous(), ours), theirs)
    }

    /// `cat` stands in for a worker that has already handshaken.
    fn piped_cat(grace: Duration) -> Channel {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let writer = child.stdin.take().unwrap();
        let reader = child.stdout.take().unwrap();
        Channel::top_level(rendezvous(), reader, writer, child, grace)
    }

    #[test]
    fn socket_channel_shares_one_descriptor() {
        let (channel, _peer) = socket_channel();
        let read = channel.read_side().unwrap().as_raw_fd();
        let write = channel.write_side().unwrap().as_raw_fd();
        assert_eq!(read, write);
        assert_eq!(channel.kind(), ChannelKind::Cloned);
        assert!(channel.worker_pid().is_none());
    }

    #[test]
    fn socket_channel_round_trip() {
        let (mut channel, mut peer) = socket_channel();
        channel.write_full(b"ping").unwrap();
        let mut buf = [0u8; 4];
        transfer_read(&mut peer, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        transfer_write(&mut peer, b"pong").unwrap();
        assert!(channel.poll_readable(Duration::from_secs(5)).unwrap());
        channel.read_full(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_is_idempotent_and_blocks_io() {
        let (mut channel, mut peer) = socket_channel();
        channel.close().unwrap();
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(channel.read_side().is_none());
        assert!(channel.write_side().is_none());
        assert!(matches!(channel.write_full(b"x"), Err(ChannelError::Closed)));
        assert!(matches!(
            channel.poll_readable(Duration::ZERO),
            Err(ChannelError::Closed)
        ));
        // rendezvous survives close
        assert_eq!(channel.rendezvous(), &rendezvous());

        let mut buf = [0u8; 1];
        assert!(transfer_read(&mut peer, &mut buf).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn peer_hang_up_is_end_of_stream() {
        let (mut channel, peer) = socket_channel();
        drop(peer);
        let mut buf = [0u8; 2];
        assert!(channel.read_full(&mut buf).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn poll_times_out_without_data() {
        let (channel, _peer) = socket_channel();
        assert!(!channel.poll_readable(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn unbounded_poll_returns_when_data_arrives() {
        let (channel, mut peer) = socket_channel();
        transfer_write(&mut peer, b"!").unwrap();
        assert!(channel.poll_readable(Duration::MAX).unwrap());
    }

    #[test]
    fn unbounded_grace_waits_for_worker() {
        let mut channel = piped_cat(Duration::MAX);
        channel.write_full(b"ok").unwrap();
        let mut buf = [0u8; 2];
        channel.read_full(&mut buf).unwrap();
        channel.close().unwrap();
        assert!(channel.worker_pid().is_none());
    }

    #[test]
    fn top_level_close_reaps_worker() {
        let mut channel = piped_cat(Duration::from_secs(5));
        assert_eq!(channel.kind(), ChannelKind::TopLevel);
        let read = channel.read_side().unwrap().as_raw_fd();
        let write = channel.write_side().unwrap().as_raw_fd();
        assert_ne!(read, write);

        channel.write_full(b"hi").unwrap();
        let mut buf = [0u8; 2];
        channel.read_full(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        channel.close().unwrap();
        assert!(channel.worker_pid().is_none());
        channel.close().unwrap();
    }

    #[test]
    fn stubborn_worker_is_killed() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let writer = child.stdin.take().unwrap();
        let reader = child.stdout.take().unwrap();
        let mut channel = Channel::top_level(
            rendezvous(),
            reader,
            writer,
            child,
            Duration::from_millis(50),
        );

        let started = Instant::now();
        channel.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
