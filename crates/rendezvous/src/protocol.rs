//! Handshake wire format shared by the controlling side and the worker.
//!
//! The worker writes, once, on its stdout:
//!
//! ```text
//! +-----------------+------------------------+------------------+
//! | header (32)     | address (32, NUL-pad)  | token (32)       |
//! +-----------------+------------------------+------------------+
//! ```
//!
//! A clone connection carries the raw 32-byte token and nothing else before
//! application traffic starts.

use std::ffi::OsStr;
use std::fmt;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::HandshakeError;
use crate::io::transfer_read;

pub const HEADER_LEN: usize = 32;
pub const ADDRESS_LEN: usize = 32;
pub const TOKEN_LEN: usize = 32;
pub const HANDSHAKE_LEN: usize = HEADER_LEN + ADDRESS_LEN + TOKEN_LEN;

/// Protocol identity. Opaque: matched byte-for-byte, never parsed.
pub const HEADER: &[u8] = concat!("58000000", "0100", "60c1", "00000000", "0000000\n").as_bytes();

const _: () = assert!(HEADER.len() == HEADER_LEN);

/// Bytes available for a path in `sockaddr_un`.
const SUN_PATH_CAPACITY: usize =
    size_of::<libc::sockaddr_un>() - std::mem::offset_of!(libc::sockaddr_un, sun_path);

const _: () = assert!(
    ADDRESS_LEN <= SUN_PATH_CAPACITY,
    "rendezvous address field does not fit in sockaddr_un"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeField {
    Header,
    Address,
    Token,
}

impl fmt::Display for HandshakeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "header",
            Self::Address => "rendezvous address",
            Self::Token => "token",
        })
    }
}

/// Fixed-width socket path as published in the handshake.
///
/// Two addresses are equal when they name the same path, whatever padding
/// follows the terminator.
#[derive(Clone, Copy)]
pub struct RendezvousAddress([u8; ADDRESS_LEN]);

impl RendezvousAddress {
    /// Longest path that still leaves room for a terminator.
    pub const MAX_PATH_LEN: usize = ADDRESS_LEN - 1;

    /// Encode a socket path. Returns `None` if the path is empty, too long,
    /// or contains a NUL or newline.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let bytes = path.as_ref().as_os_str().as_bytes();
        if bytes.is_empty()
            || bytes.len() > Self::MAX_PATH_LEN
            || bytes.iter().any(|&b| b == 0 || b == b'\n')
        {
            return None;
        }
        let mut field = [0u8; ADDRESS_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Some(Self(field))
    }

    /// Take the field verbatim, as read off the wire.
    pub fn from_field(field: [u8; ADDRESS_LEN]) -> Self {
        Self(field)
    }

    /// Path bytes: everything before the first NUL or newline. Some workers
    /// pad with a trailing `\n` instead of NUL. The last byte of the field is
    /// always treated as the terminator.
    pub fn path(&self) -> &Path {
        let bytes = &self.0[..Self::MAX_PATH_LEN];
        let end = bytes
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .unwrap_or(Self::MAX_PATH_LEN);
        Path::new(OsStr::from_bytes(&bytes[..end]))
    }

    pub fn is_empty(&self) -> bool {
        self.path().as_os_str().is_empty()
    }

    pub fn as_field(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl PartialEq for RendezvousAddress {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl Eq for RendezvousAddress {}

impl fmt::Debug for RendezvousAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RendezvousAddress").field(&self.path()).finish()
    }
}

impl fmt::Display for RendezvousAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Shared secret authorizing a clone connection. Never logged.
#[derive(Clone, Copy)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Comparison whose running time does not depend on where the first
    /// mismatching byte is.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate.len() != TOKEN_LEN {
            return false;
        }
        self.0
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

/// The capability a worker hands out: where to connect and what to present.
///
/// Copied verbatim into every channel cloned from the one that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub address: RendezvousAddress,
    pub token: Token,
}

impl Rendezvous {
    pub fn new(address: RendezvousAddress, token: Token) -> Self {
        Self { address, token }
    }

    /// Full handshake as the worker writes it.
    pub fn handshake_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[..HEADER_LEN].copy_from_slice(HEADER);
        out[HEADER_LEN..HEADER_LEN + ADDRESS_LEN].copy_from_slice(self.address.as_field());
        out[HEADER_LEN + ADDRESS_LEN..].copy_from_slice(self.token.as_bytes());
        out
    }
}

/// Read and validate a handshake: header, then address, then token.
pub fn read_handshake<R: Read + ?Sized>(endpoint: &mut R) -> Result<Rendezvous, HandshakeError> {
    let mut header = [0u8; HEADER_LEN];
    transfer_read(endpoint, &mut header).map_err(|source| HandshakeError::Transfer {
        field: HandshakeField::Header,
        source,
    })?;
    if header[..] != *HEADER {
        return Err(HandshakeError::HeaderMismatch {
            expected: String::from_utf8_lossy(HEADER).into_owned(),
            found: String::from_utf8_lossy(&header).into_owned(),
        });
    }
    tracing::trace!("Handshake header matched");

    let mut address = [0u8; ADDRESS_LEN];
    transfer_read(endpoint, &mut address).map_err(|source| HandshakeError::Transfer {
        field: HandshakeField::Address,
        source,
    })?;
    let address = RendezvousAddress::from_field(address);
    if address.is_empty() {
        return Err(HandshakeError::EmptyAddress);
    }

    let mut token = [0u8; TOKEN_LEN];
    transfer_read(endpoint, &mut token).map_err(|source| HandshakeError::Transfer {
        field: HandshakeField::Token,
        source,
    })?;

    tracing::debug!(address = %address, "Handshake complete");
    Ok(Rendezvous::new(address, Token::from_bytes(token)))
}
