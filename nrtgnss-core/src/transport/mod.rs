//! Transport clients: protocol-specific file fetchers behind one interface.
//!
//! A transport is chosen once per provider when the catalog is loaded
//! (`registry_for`). Each acquisition attempt opens a fresh session with
//! `connect`, so every attempt is bounded by the provider's timeout and a
//! broken connection never leaks into the next attempt.
//!
//! "File not found on this provider" is an ordinary value (`Ok(false)`),
//! not an error, so retry and fallback are plain loops over results.

pub mod ftp;
pub mod http;
pub mod ssh;

use crate::catalog::{ProviderCatalog, ProviderDescriptor, Protocol};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use ftp::FtpTransport;
pub use http::HttpTransport;
pub use ssh::{SshMode, SshTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected by {0}")]
    Authentication(String),

    #[error("transfer of {path} truncated: expected {expected} bytes, got {actual}")]
    Truncated { path: String, expected: u64, actual: u64 },

    #[error("empty transfer: {0}")]
    Empty(String),

    #[error("unexpected content for {path}: {reason}")]
    UnexpectedContent { path: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("local I/O: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The provider could not be reached at all.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, TransportError::Connect { .. } | TransportError::Timeout(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, TransportError::Authentication(_))
    }
}

/// A configured way of reaching one provider.
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn host(&self) -> &str;

    /// Open a session; bounded by the provider's timeout.
    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError>;
}

/// An open connection to a provider.
pub trait TransferSession {
    /// Fetch `remote` into `local`. `Ok(false)` means the file does not
    /// exist on this provider; a partial `local` file is removed on error.
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError>;

    /// Names (not paths) of the entries of a remote directory. A missing
    /// directory lists as empty.
    fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError>;
}

/// Build the transport for a provider descriptor.
pub fn for_provider(desc: &ProviderDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(match desc.protocol {
        Protocol::Http | Protocol::Https => Arc::new(HttpTransport::new(desc)?),
        Protocol::Ftp => Arc::new(FtpTransport::new(desc)),
        Protocol::Sftp => Arc::new(SshTransport::new(desc, SshMode::Sftp)),
        Protocol::Scp => Arc::new(SshTransport::new(desc, SshMode::Scp)),
    })
}

/// Transports keyed by provider name.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: &str, transport: Arc<dyn Transport>) {
        self.transports.insert(provider.to_ascii_lowercase(), transport);
    }

    pub fn get(&self, provider: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.get(&provider.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.transports.keys().collect();
        names.sort();
        f.debug_struct("TransportRegistry").field("providers", &names).finish()
    }
}

/// One transport per catalog provider.
pub fn registry_for(catalog: &ProviderCatalog) -> Result<TransportRegistry, TransportError> {
    let mut registry = TransportRegistry::new();
    for desc in catalog.providers() {
        registry.insert(&desc.name, for_provider(desc)?);
    }
    Ok(registry)
}

// ── Helpers shared by the implementations ───────────────────────────

/// Join a remote directory and filename with exactly one `/`.
pub fn join_remote(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        return file.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), file.trim_start_matches('/'))
}

/// Last component of a remote path as returned by a listing.
pub(crate) fn base_name(entry: &str) -> &str {
    entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry)
}

pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::Connect {
            host: host.to_string(),
            reason: "no address".into(),
        })
}

pub(crate) fn io_error(e: io::Error, context: &str) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout(context.to_string()),
        _ => TransportError::Io(e),
    }
}

/// Reject zero-length or short transfers.
pub(crate) fn verify_length(remote: &str, written: u64, expected: Option<u64>) -> Result<(), TransportError> {
    if written == 0 {
        return Err(TransportError::Empty(remote.to_string()));
    }
    match expected {
        Some(expected) if expected != written => Err(TransportError::Truncated {
            path: remote.to_string(),
            expected,
            actual: written,
        }),
        _ => Ok(()),
    }
}

/// Stream `reader` into `local`, verifying the length. Removes `local` on failure.
pub(crate) fn write_stream(
    reader: &mut dyn Read,
    local: &Path,
    remote: &str,
    expected: Option<u64>,
) -> Result<u64, TransportError> {
    let copied = File::create(local).and_then(|mut file| {
        let n = io::copy(reader, &mut file)?;
        file.sync_all()?;
        Ok(n)
    });
    let result = match copied {
        Ok(written) => verify_length(remote, written, expected).map(|_| written),
        Err(e) => Err(io_error(e, remote)),
    };
    if result.is_err() {
        let _ = fs::remove_file(local);
    }
    result
}
