//! Secure-copy and SFTP transports over libssh2.
//!
//! Both modes authenticate the same way (key file, then password, then the
//! SSH agent). `Scp` transfers files with `scp_recv` and uses the SFTP
//! subsystem only for listing and existence checks.

use super::{io_error, resolve, write_stream, TransferSession, Transport, TransportError};
use crate::catalog::{ProviderDescriptor, Protocol};
use ssh2::{ErrorCode, Session, Sftp};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// libssh2 SFTP status for a missing path.
const SFTP_NO_SUCH_FILE: i32 = 2;
/// libssh2 session error raised when the remote scp refuses a path.
const SCP_PROTOCOL_ERROR: i32 = -28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    Scp,
    Sftp,
}

pub struct SshTransport {
    mode: SshMode,
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key_file: Option<PathBuf>,
    timeout: Duration,
}

impl SshTransport {
    pub fn new(desc: &ProviderDescriptor, mode: SshMode) -> Self {
        Self {
            mode,
            host: desc.host.clone(),
            port: desc.port(),
            username: desc.username.clone().unwrap_or_else(|| "anonymous".into()),
            password: desc.password.clone(),
            key_file: desc.key_file.clone(),
            timeout: desc.timeout(),
        }
    }

    fn authenticate(&self, session: &Session) -> Result<(), TransportError> {
        let result = if let Some(key) = &self.key_file {
            session.userauth_pubkey_file(&self.username, None, key, self.password.as_deref())
        } else if let Some(password) = &self.password {
            session.userauth_password(&self.username, password)
        } else {
            session.userauth_agent(&self.username)
        };
        match result {
            Ok(()) if session.authenticated() => Ok(()),
            _ => Err(TransportError::Authentication(self.host.clone())),
        }
    }
}

impl Transport for SshTransport {
    fn protocol(&self) -> Protocol {
        match self.mode {
            SshMode::Scp => Protocol::Scp,
            SshMode::Sftp => Protocol::Sftp,
        }
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError> {
        let addr = resolve(&self.host, self.port)?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| match io_error(e, &self.host) {
            TransportError::Io(e) => TransportError::Connect {
                host: self.host.clone(),
                reason: e.to_string(),
            },
            other => other,
        })?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;

        let mut session = Session::new().map_err(|e| ssh_err(&self.host, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis().min(u128::from(u32::MAX)) as u32);
        session.handshake().map_err(|e| ssh_err(&self.host, e))?;
        self.authenticate(&session)?;

        Ok(Box::new(SshSession {
            mode: self.mode,
            host: self.host.clone(),
            session,
            sftp: None,
        }))
    }
}

struct SshSession {
    mode: SshMode,
    host: String,
    session: Session,
    sftp: Option<Sftp>,
}

fn ssh_err(host: &str, e: ssh2::Error) -> TransportError {
    match e.code() {
        // LIBSSH2_ERROR_TIMEOUT
        ErrorCode::Session(-9) => TransportError::Timeout(format!("{host}: {e}")),
        _ => TransportError::Protocol(format!("{host}: {e}")),
    }
}

fn sftp_missing(e: &ssh2::Error) -> bool {
    e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

impl SshSession {
    fn sftp(&mut self) -> Result<&Sftp, TransportError> {
        if self.sftp.is_none() {
            let sftp = self.session.sftp().map_err(|e| ssh_err(&self.host, e))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| TransportError::Protocol(format!("{}: SFTP subsystem unavailable", self.host)))
    }
}

impl TransferSession for SshSession {
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError> {
        let host = self.host.clone();
        match self.mode {
            SshMode::Scp => {
                let (mut channel, stat) = match self.session.scp_recv(Path::new(remote)) {
                    Ok(pair) => pair,
                    Err(e) if e.code() == ErrorCode::Session(SCP_PROTOCOL_ERROR) => return Ok(false),
                    Err(e) => return Err(ssh_err(&host, e)),
                };
                write_stream(&mut channel, local, remote, Some(stat.size()))?;
                let _ = channel.send_eof();
                let _ = channel.wait_close();
                Ok(true)
            }
            SshMode::Sftp => {
                let sftp = self.sftp()?;
                let expected = match sftp.stat(Path::new(remote)) {
                    Ok(stat) => stat.size,
                    Err(e) if sftp_missing(&e) => return Ok(false),
                    Err(e) => return Err(ssh_err(&host, e)),
                };
                let mut file = sftp.open(Path::new(remote)).map_err(|e| ssh_err(&host, e))?;
                write_stream(&mut file, local, remote, expected)?;
                Ok(true)
            }
        }
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let host = self.host.clone();
        let sftp = self.sftp()?;
        match sftp.readdir(Path::new(dir)) {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter_map(|(path, _)| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect()),
            Err(e) if sftp_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(ssh_err(&host, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(protocol: &str, extra: &str) -> ProviderDescriptor {
        toml::from_str(&format!(
            "name = \"OSGB\"\nprotocol = \"{protocol}\"\nhost = \"does-not-resolve.invalid\"\ntimeout_secs = 2\n{extra}"
        ))
        .unwrap()
    }

    #[test]
    fn protocol_follows_mode() {
        let scp = SshTransport::new(&descriptor("scp", ""), SshMode::Scp);
        let sftp = SshTransport::new(&descriptor("sftp", ""), SshMode::Sftp);
        assert_eq!(scp.protocol(), Protocol::Scp);
        assert_eq!(sftp.protocol(), Protocol::Sftp);
        assert_eq!(scp.port, 22);
    }

    #[test]
    fn key_file_is_carried() {
        let t = SshTransport::new(&descriptor("sftp", "key_file = \"/etc/nrtgnss/id_ed25519\""), SshMode::Sftp);
        assert_eq!(t.key_file.as_deref(), Some(Path::new("/etc/nrtgnss/id_ed25519")));
    }

    #[test]
    fn unresolvable_host_is_a_connection_failure() {
        let t = SshTransport::new(&descriptor("scp", ""), SshMode::Scp);
        match t.connect() {
            Err(e) => assert!(e.is_connection_failure(), "{e}"),
            Ok(_) => panic!("connected to an invalid host"),
        }
    }
}
