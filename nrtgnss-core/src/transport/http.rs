//! HTTP(S) transport over a blocking reqwest client, with optional basic auth.

use super::{base_name, io_error, verify_length, TransferSession, Transport, TransportError};
use crate::catalog::{ProviderDescriptor, Protocol};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Bytes inspected when sniffing for an HTML page in place of data.
const SNIFF_LEN: usize = 512;

pub struct HttpTransport {
    client: Client,
    protocol: Protocol,
    host: String,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpTransport {
    pub fn new(desc: &ProviderDescriptor) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(desc.timeout())
            .connect_timeout(desc.timeout())
            .user_agent(concat!("nrtgnss/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Protocol(format!("build HTTP client: {e}")))?;

        let scheme = if desc.protocol == Protocol::Http { "http" } else { "https" };
        let base_url = match desc.port {
            Some(port) => format!("{scheme}://{}:{port}", desc.host),
            None => format!("{scheme}://{}", desc.host),
        };

        Ok(Self {
            client,
            protocol: desc.protocol,
            host: desc.host.clone(),
            base_url,
            username: desc.username.clone(),
            password: desc.password.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError> {
        // HTTP is connectionless at this level; the client pools sockets.
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            host: self.host.clone(),
            base_url: self.base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

struct HttpSession {
    client: Client,
    host: String,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSession {
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    fn map_err(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(format!("{}: {e}", self.host))
        } else if e.is_connect() {
            TransportError::Connect {
                host: self.host.clone(),
                reason: e.to_string(),
            }
        } else {
            TransportError::Protocol(e.to_string())
        }
    }

    /// `Ok(None)` for not-found statuses.
    fn send(&self, req: RequestBuilder, url: &str) -> Result<Option<Response>, TransportError> {
        let resp = self.authed(req).send().map_err(|e| self.map_err(e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Authentication(self.host.clone()));
        }
        if !status.is_success() {
            return Err(TransportError::Protocol(format!("HTTP {status} for {url}")));
        }
        Ok(Some(resp))
    }
}

impl TransferSession for HttpSession {
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError> {
        let url = self.url(remote);
        let Some(mut resp) = self.send(self.client.get(&url), &url)? else {
            return Ok(false);
        };

        if is_html_content_type(&resp) {
            return Err(TransportError::UnexpectedContent {
                path: remote.to_string(),
                reason: "server returned an HTML page".into(),
            });
        }

        let expected = resp.content_length();
        let written = File::create(local)
            .map_err(TransportError::from)
            .and_then(|mut file| resp.copy_to(&mut file).map_err(|e| self.map_err(e)));

        let checked = written.and_then(|n| {
            verify_length(remote, n, expected)?;
            if sniff_html(local).map_err(|e| io_error(e, remote))? {
                return Err(TransportError::UnexpectedContent {
                    path: remote.to_string(),
                    reason: "body is an HTML page".into(),
                });
            }
            Ok(())
        });

        if let Err(e) = checked {
            let _ = fs::remove_file(local);
            return Err(e);
        }
        Ok(true)
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/", self.url(dir).trim_end_matches('/'));
        let Some(resp) = self.send(self.client.get(&url), &url)? else {
            return Ok(Vec::new());
        };
        let body = resp.text().map_err(|e| self.map_err(e))?;
        Ok(parse_index(&body))
    }
}

fn is_html_content_type(resp: &Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("text/html"))
}

fn sniff_html(local: &Path) -> std::io::Result<bool> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    File::open(local)?.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(looks_like_html(&head))
}

/// Login portals and error pages served with a 200 status.
pub(crate) fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html")
}

/// Extract entry names from an autoindex-style directory page.
pub(crate) fn parse_index(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = body;
    while let Some(pos) = rest.find("href=\"") {
        rest = &rest[pos + 6..];
        let Some(end) = rest.find('"') else { break };
        let href = &rest[..end];
        rest = &rest[end..];

        if href.starts_with('?') || href.starts_with('#') || href.starts_with("..") || href.contains("://") {
            continue;
        }
        let name = base_name(href);
        if name.is_empty() || (href.starts_with('/') && href.ends_with('/')) {
            continue;
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_sniffing() {
        assert!(looks_like_html(b"  <!DOCTYPE html><html>login</html>"));
        assert!(looks_like_html(b"<HTML><body>"));
        assert!(!looks_like_html(b"     2.11           OBSERVATION DATA"));
        assert!(!looks_like_html(&[0x1f, 0x8b, 0x08, 0x00]));
    }

    #[test]
    fn parses_autoindex_listing() {
        let body = r#"
<html><body><h1>Index of /hourly/2024/260/13</h1>
<a href="?C=N;O=D">Name</a>
<a href="../">Parent Directory</a>
<a href="abmf260n.24d.gz">abmf260n.24d.gz</a>
<a href="ABMF00GLP_R_20242601300_01H_30S_MO.crx.gz">ABMF00GLP...</a>
<a href="https://elsewhere.example/">elsewhere</a>
<a href="abmf260n.24d.gz">duplicate</a>
<a href="sub/">sub/</a>
</body></html>"#;
        assert_eq!(
            parse_index(body),
            vec![
                "abmf260n.24d.gz".to_string(),
                "ABMF00GLP_R_20242601300_01H_30S_MO.crx.gz".to_string(),
                "sub".to_string(),
            ]
        );
    }

    #[test]
    fn base_url_includes_explicit_port() {
        let desc: ProviderDescriptor = toml::from_str(
            r#"
name = "LOCAL"
protocol = "http"
host = "127.0.0.1"
port = 8080
"#,
        )
        .unwrap();
        let transport = HttpTransport::new(&desc).unwrap();
        assert_eq!(transport.base_url, "http://127.0.0.1:8080");
        assert_eq!(transport.protocol(), Protocol::Http);
    }
}
