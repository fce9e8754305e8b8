//! Provider catalog: prioritized descriptions of remote data sources.
//!
//! The catalog is a TOML document with one `[[provider]]` table per source.
//! It is loaded and validated once at startup and is read-only afterwards.
//!
//! ```toml
//! [[provider]]
//! name = "BKG"
//! protocol = "https"
//! host = "igs.bkg.bund.de"
//! priority = 2
//! hourly = true
//!
//! [provider.templates.hourly]
//! dir = "/root_ftp/IGS/nrt/{doy}/{hour}"
//! file = "{station}{doy}{hour_char}.{yy}d.gz"
//! ```
//!
//! Meteorological files come from their own `met` capability and
//! `[provider.templates.met]`, never from the observation templates.

use crate::template::Template;
use crate::timekey::Granularity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read provider catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse provider catalog: {0}")]
    Parse(String),

    #[error("provider catalog defines no providers")]
    Empty,

    #[error("duplicate provider name '{0}'")]
    DuplicateProvider(String),

    #[error("provider '{provider}': field '{field}' must not be empty")]
    EmptyField { provider: String, field: &'static str },

    #[error("provider '{provider}' serves {granularity} data but has no {granularity} templates")]
    MissingTemplate {
        provider: String,
        granularity: Granularity,
    },

    #[error("provider '{0}' serves meteorological data but has no met templates")]
    MissingMetTemplate(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

/// What a transfer delivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// RINEX observation file of one station.
    #[default]
    Observation,
    /// RINEX meteorological file of one station.
    Meteorological,
}

impl ArtifactKind {
    /// RINEX file type letter, the last character of the local extension.
    pub fn type_letter(self) -> char {
        match self {
            ArtifactKind::Observation => 'o',
            ArtifactKind::Meteorological => 'm',
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Observation => "observation",
            ArtifactKind::Meteorological => "meteorological",
        })
    }
}

/// Transfer protocol, selected once per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ftp,
    Sftp,
    Scp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
            Protocol::Ftp => 21,
            Protocol::Sftp | Protocol::Scp => 22,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::Scp => "scp",
        };
        f.write_str(s)
    }
}

/// Remote directory and filename templates for one granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathTemplates {
    pub dir: Template,
    pub file: Template,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTemplates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<PathTemplates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<PathTemplates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subhourly: Option<PathTemplates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub met: Option<PathTemplates>,
}

impl CategoryTemplates {
    pub fn get(&self, granularity: Granularity) -> Option<&PathTemplates> {
        match granularity {
            Granularity::Hourly => self.hourly.as_ref(),
            Granularity::Daily => self.daily.as_ref(),
            Granularity::SubHourly => self.subhourly.as_ref(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_priority() -> u32 {
    100
}

/// One remote data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Private key for key-based SSH authentication.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Lower is tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub hourly: bool,
    #[serde(default)]
    pub daily: bool,
    #[serde(default)]
    pub subhourly: bool,
    #[serde(default)]
    pub met: bool,
    #[serde(default)]
    pub templates: CategoryTemplates,
}

impl ProviderDescriptor {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Per-attempt timeout for connect and transfer calls.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    fn flag(&self, granularity: Granularity) -> bool {
        match granularity {
            Granularity::Hourly => self.hourly,
            Granularity::Daily => self.daily,
            Granularity::SubHourly => self.subhourly,
        }
    }

    /// True when the provider both claims and is configured for `kind`
    /// at `granularity`.
    pub fn supports(&self, kind: ArtifactKind, granularity: Granularity) -> bool {
        self.templates_for(kind, granularity).is_some()
    }

    /// Met templates apply to whatever key shape the met category uses.
    pub fn templates_for(&self, kind: ArtifactKind, granularity: Granularity) -> Option<&PathTemplates> {
        match kind {
            ArtifactKind::Observation if self.flag(granularity) => self.templates.get(granularity),
            ArtifactKind::Meteorological if self.met => self.templates.met.as_ref(),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::EmptyField {
                provider: self.name.clone(),
                field: "name",
            });
        }
        if self.host.trim().is_empty() {
            return Err(CatalogError::EmptyField {
                provider: self.name.clone(),
                field: "host",
            });
        }
        for granularity in Granularity::ALL {
            if self.flag(granularity) && self.templates.get(granularity).is_none() {
                return Err(CatalogError::MissingTemplate {
                    provider: self.name.clone(),
                    granularity,
                });
            }
        }
        if self.met && self.templates.met.is_none() {
            return Err(CatalogError::MissingMetTemplate(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "provider")]
    providers: Vec<ProviderDescriptor>,
}

/// Validated providers in priority order (priority, then name).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCatalog {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderCatalog {
    /// Load a catalog from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a catalog from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(file.providers)
    }

    pub fn new(mut providers: Vec<ProviderDescriptor>) -> Result<Self, CatalogError> {
        if providers.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for p in &providers {
            p.validate()?;
            if !seen.insert(p.name.to_ascii_lowercase()) {
                return Err(CatalogError::DuplicateProvider(p.name.clone()));
            }
        }
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(Self { providers })
    }

    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Providers serving `kind` at `granularity`, in priority order.
    pub fn serving(&self, kind: ArtifactKind, granularity: Granularity) -> Vec<&ProviderDescriptor> {
        self.providers.iter().filter(|p| p.supports(kind, granularity)).collect()
    }

    /// Providers in an explicit order (e.g. a per-category override).
    ///
    /// Names must exist in the catalog; providers that do not serve the
    /// task are kept, the acquisition engine skips them.
    pub fn ordered(&self, names: &[String]) -> Result<Vec<&ProviderDescriptor>, CatalogError> {
        names
            .iter()
            .map(|n| self.get(n).ok_or_else(|| CatalogError::UnknownProvider(n.clone())))
            .collect()
    }

    /// Deterministic content hash, used to tag run summaries.
    /// Passwords are excluded from the hashed form.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}
