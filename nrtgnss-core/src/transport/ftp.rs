//! Plain FTP transport (passive mode, binary transfers).

use super::{base_name, io_error, resolve, write_stream, TransferSession, Transport, TransportError};
use crate::catalog::{ProviderDescriptor, Protocol};
use std::fs;
use std::path::Path;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};

pub struct FtpTransport {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl FtpTransport {
    /// Providers without credentials are accessed anonymously.
    pub fn new(desc: &ProviderDescriptor) -> Self {
        Self {
            host: desc.host.clone(),
            port: desc.port(),
            username: desc.username.clone().unwrap_or_else(|| "anonymous".into()),
            password: desc.password.clone().unwrap_or_else(|| "anonymous@".into()),
            timeout: desc.timeout(),
        }
    }
}

fn map_err(host: &str, e: FtpError) -> TransportError {
    match e {
        FtpError::ConnectionError(io) => match io_error(io, host) {
            TransportError::Io(io) => TransportError::Connect {
                host: host.to_string(),
                reason: io.to_string(),
            },
            other => other,
        },
        FtpError::UnexpectedResponse(resp) if resp.status == Status::NotLoggedIn => {
            TransportError::Authentication(host.to_string())
        }
        other => TransportError::Protocol(format!("{host}: {other}")),
    }
}

fn is_unavailable(e: &FtpError) -> bool {
    matches!(e, FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable)
}

impl Transport for FtpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError> {
        let addr = resolve(&self.host, self.port)?;
        let mut ftp = FtpStream::connect_timeout(addr, self.timeout).map_err(|e| map_err(&self.host, e))?;

        let stream = ftp.get_ref();
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        ftp.login(&self.username, &self.password)
            .map_err(|e| match map_err(&self.host, e) {
                TransportError::Protocol(_) => TransportError::Authentication(self.host.clone()),
                other => other,
            })?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| map_err(&self.host, e))?;
        ftp.set_mode(Mode::Passive);

        Ok(Box::new(FtpSession {
            ftp,
            host: self.host.clone(),
        }))
    }
}

struct FtpSession {
    ftp: FtpStream,
    host: String,
}

impl TransferSession for FtpSession {
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError> {
        // SIZE is optional on some servers; without it only the empty check applies.
        let expected = match self.ftp.size(remote) {
            Ok(n) => Some(n as u64),
            Err(e) if is_unavailable(&e) => return Ok(false),
            Err(_) => None,
        };

        // The data connection streams straight into the staging file.
        match self.ftp.retr(remote, |reader| Ok(write_stream(reader, local, remote, expected))) {
            Ok(written) => written.map(|_| true),
            Err(e) => {
                let _ = fs::remove_file(local);
                if is_unavailable(&e) {
                    Ok(false)
                } else {
                    Err(map_err(&self.host, e))
                }
            }
        }
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        match self.ftp.nlst(Some(dir)) {
            Ok(entries) => Ok(entries.iter().map(|e| base_name(e).to_string()).collect()),
            Err(e) if is_unavailable(&e) => Ok(Vec::new()),
            Err(e) => Err(map_err(&self.host, e)),
        }
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let _ = self.ftp.quit();
    }
}
