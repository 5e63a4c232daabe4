//! Control channel isolation.
//!
//! The worker's stdin/stdout are the root channel. Anything else in the
//! process that prints to fd 1 (a stray `println!`, a library, a child
//! process) would corrupt that byte stream.
//!
//! We duplicate fds 0/1 to fresh close-on-exec descriptors, then point fd 0
//! at `/dev/null` and fd 1 at stderr. Only the returned descriptors reach
//! the controller.
//!
//! ## Safety contracts
//!
//! 1. Called once, early, before any other code reads fd 0 or writes fd 1
//! 2. Standard fds (0, 1, 2) are guaranteed open by the OS at process startup
//! 3. `OwnedFd::from_raw_fd` on 0/1 is paired with `forget` so they are never
//!    closed, only replaced by `dup2`

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;

use nix::unistd::dup2;
use tokio::net::unix::pipe;

use crate::server::{BoxReader, BoxWriter};

pub struct ControlChannelFds {
    pub stdin_fd: OwnedFd,
    pub stdout_fd: OwnedFd,
}

/// Move the control channel off fds 0/1.
pub fn isolate() -> io::Result<ControlChannelFds> {
    // Safety: fds 0/1/2 are open for the life of the process (contract 2).
    let (stdin, stdout, stderr) = unsafe {
        (
            BorrowedFd::borrow_raw(0),
            BorrowedFd::borrow_raw(1),
            BorrowedFd::borrow_raw(2),
        )
    };

    tracing::debug!("Preserving control channel");
    let control_stdin = stdin.try_clone_to_owned()?;
    let control_stdout = stdout.try_clone_to_owned()?;
    tracing::trace!(
        control_stdin = control_stdin.as_raw_fd(),
        control_stdout = control_stdout.as_raw_fd(),
        "Duped control fds"
    );

    let devnull = OwnedFd::from(File::open("/dev/null")?);
    let mut target_fd0 = unsafe { OwnedFd::from_raw_fd(0) };
    let replaced = dup2(&devnull, &mut target_fd0);
    std::mem::forget(target_fd0); // Don't close fd 0
    replaced.map_err(|e| io::Error::other(format!("dup2(stdin) failed: {}", e)))?;

    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    let replaced = dup2(stderr, &mut target_fd1);
    std::mem::forget(target_fd1); // Don't close fd 1
    replaced.map_err(|e| io::Error::other(format!("dup2(stdout) failed: {}", e)))?;

    tracing::debug!("fd 0 now /dev/null, fd 1 now stderr");

    Ok(ControlChannelFds {
        stdin_fd: control_stdin,
        stdout_fd: control_stdout,
    })
}

/// Wrap a control descriptor for tokio. Pipes get a readiness-driven
/// receiver; anything else (a file, a socket pair) falls back to
/// `tokio::fs::File`.
pub fn async_reader(fd: OwnedFd) -> io::Result<BoxReader> {
    let file = File::from(fd);
    if file.metadata()?.file_type().is_fifo() {
        Ok(Box::new(pipe::Receiver::from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

pub fn async_writer(fd: OwnedFd) -> io::Result<BoxWriter> {
    let file = File::from(fd);
    if file.metadata()?.file_type().is_fifo() {
        Ok(Box::new(pipe::Sender::from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}
