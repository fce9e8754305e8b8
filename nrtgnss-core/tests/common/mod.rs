//! Shared fixtures: an in-memory transport that records every call.

#![allow(dead_code)]

use nrtgnss_core::catalog::{Protocol, ProviderCatalog};
use nrtgnss_core::transport::{TransferSession, Transport, TransportError, TransportRegistry};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Failure injected on `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    Authentication,
}

#[derive(Default)]
struct State {
    files: HashMap<String, Vec<u8>>,
    truncated: Vec<String>,
    connect_failure: Option<ConnectFailure>,
    calls: Vec<String>,
}

/// Serves files from memory, keyed by full remote path.
#[derive(Clone)]
pub struct MockTransport {
    host: String,
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn with_file(self, remote: &str, bytes: &[u8]) -> Self {
        self.state.lock().unwrap().files.insert(remote.to_string(), bytes.to_vec());
        self
    }

    /// `remote` exists but every transfer comes back short.
    pub fn with_truncated(self, remote: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.files.insert(remote.to_string(), b"partial".to_vec());
            state.truncated.push(remote.to_string());
        }
        self
    }

    pub fn failing(self, failure: ConnectFailure) -> Self {
        self.state.lock().unwrap().connect_failure = Some(failure);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

impl Transport for MockTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Https
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) -> Result<Box<dyn TransferSession>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("connect".into());
        match state.connect_failure {
            Some(ConnectFailure::Refused) => Err(TransportError::Connect {
                host: self.host.clone(),
                reason: "connection refused".into(),
            }),
            Some(ConnectFailure::Authentication) => Err(TransportError::Authentication(self.host.clone())),
            None => Ok(Box::new(MockSession {
                state: Arc::clone(&self.state),
            })),
        }
    }
}

struct MockSession {
    state: Arc<Mutex<State>>,
}

impl TransferSession for MockSession {
    fn download(&mut self, remote: &str, local: &Path) -> Result<bool, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("download {remote}"));
        if state.truncated.iter().any(|t| t == remote) {
            return Err(TransportError::Truncated {
                path: remote.to_string(),
                expected: 100,
                actual: 7,
            });
        }
        match state.files.get(remote) {
            Some(bytes) => {
                std::fs::write(local, bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list {dir}"));
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(state
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

/// Three hourly providers: `alpha` (priority 1, also sub-hourly and met),
/// `beta` (2) and `gamma` (3, long-form names located by wildcard search,
/// daily files as `.Z`).
pub const CATALOG: &str = r#"
[[provider]]
name = "alpha"
protocol = "https"
host = "alpha.example"
priority = 1
hourly = true
daily = true
subhourly = true
met = true

[provider.templates.hourly]
dir = "/hourly/{year}/{doy}"
file = "{station}{doy}{hour_char}.{yy}o"

[provider.templates.daily]
dir = "/daily/{year}/{doy}"
file = "{station}{doy}0.{yy}o.gz"

[provider.templates.subhourly]
dir = "/highrate/{year}/{doy}"
file = "{station}{doy}{hour_char}{minute}.{yy}o"

[provider.templates.met]
dir = "/met/{year}/{doy}"
file = "{station}{doy}{hour_char}{minute}.{yy}m"

[[provider]]
name = "beta"
protocol = "ftp"
host = "beta.example"
priority = 2
hourly = true

[provider.templates.hourly]
dir = "/pub/{year}/{doy}/{hour}"
file = "{station}{doy}{hour_char}.{yy}o"

[[provider]]
name = "gamma"
protocol = "sftp"
host = "gamma.example"
priority = 3
hourly = true
daily = true

[provider.templates.hourly]
dir = "/rinex/{year}/{doy}"
file = "{STATION}00*_R_{year}{doy}{hour}00_01H_30S_MO.rnx"

[provider.templates.daily]
dir = "/compress/{year}/{doy}"
file = "{station}{doy}0.{yy}o.Z"
"#;

pub fn catalog() -> ProviderCatalog {
    ProviderCatalog::from_toml(CATALOG).unwrap()
}

pub fn registry(transports: &[(&str, &MockTransport)]) -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    for (name, transport) in transports {
        registry.insert(name, Arc::new((*transport).clone()));
    }
    registry
}
