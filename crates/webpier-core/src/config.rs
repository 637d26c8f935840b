//! File-backed configuration store.
//!
//! Layout of a home directory:
//! - `webpier.json`: global settings (local pier identity, NAT, DHT, email);
//! - `<owner>/<name>/webpier.json`: JSON array of services declared for the
//!   pier `owner/name` (exported services live under the local pier, imported
//!   ones under the pier exporting them);
//! - `<owner>/<name>/cert.crt`: certificate material of that pier.
//!
//! Readers are expected to hold the configuration lock (see
//! [`Repository::lock`]) for the whole read-modify cycle; the `save_*`
//! helpers take it themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::protocol::Handle;

/// Name of the global config file and of every per-pier service list.
pub const CONFIG_FILE: &str = "webpier.json";
/// Configuration lock shared by the daemon and configuration editors.
pub const LOCK_FILE: &str = "webpier.lock";
/// Single-instance lock held by a running daemon.
pub const INSTANCE_FILE: &str = "webpier.pid";
/// Certificate file inside a pier directory.
pub const CERT_FILE: &str = "cert.crt";

/// Global daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Local pier identity (`owner/name`).
    #[serde(default)]
    pub pier: String,
    #[serde(default)]
    pub nat: NatConfig,
    #[serde(default)]
    pub dht: DhtConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Rendezvous used when a service does not override it.
    #[serde(default)]
    pub rendezvous: RendezvousKind,
    /// Log level handed to tunnel processes.
    #[serde(default = "default_log")]
    pub log: String,
    /// Home directory the config was loaded from.
    #[serde(skip)]
    pub home: PathBuf,
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            pier: String::new(),
            nat: NatConfig::default(),
            dht: DhtConfig::default(),
            email: EmailConfig::default(),
            rendezvous: RendezvousKind::default(),
            log: default_log(),
            home: PathBuf::new(),
        }
    }
}

/// NAT traversal settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatConfig {
    /// STUN server used to discover the public endpoint.
    pub stun: String,
    /// TTL of the hole-punching probes.
    pub hops: u8,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun: "stun.ekiga.net".to_string(),
            hops: 7,
        }
    }
}

/// DHT rendezvous settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtConfig {
    pub bootstrap: String,
    /// Local DHT port, 0 for any.
    pub port: u16,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap: "bootstrap.jami.net:4222".to_string(),
            port: 0,
        }
    }
}

/// Email rendezvous settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp: String,
    pub imap: String,
    pub login: String,
    pub password: String,
    pub cert: String,
    pub key: String,
    pub ca: String,
}

/// Out-of-band channel used to exchange traversal parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendezvousKind {
    #[default]
    Dht,
    Email,
}

/// Declaration of one exported or imported service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// `true` when exported by the local pier.
    pub local: bool,
    pub name: String,
    /// Importer piers (space separated) for an exported service, the
    /// exporter pier for an imported one.
    pub pier: String,
    /// Local TCP address of the service.
    pub address: String,
    /// Local UDP endpoint the tunnel binds to.
    #[serde(default)]
    pub gateway: String,
    /// Rendezvous override (`dht` or `email`); empty means the global one.
    #[serde(default)]
    pub rendezvous: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub obscure: bool,
}

impl ServiceSpec {
    /// Target piers listed in `pier`, deduplicated.
    pub fn peers(&self) -> BTreeSet<&str> {
        self.pier.split_whitespace().collect()
    }

    /// Copy of this spec addressing only `peer`.
    #[must_use]
    pub fn for_peer(&self, peer: &str) -> Self {
        Self {
            pier: peer.to_string(),
            ..self.clone()
        }
    }
}

/// Rendezvous settings resolved for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousOptions {
    pub kind: RendezvousKind,
    pub stun: String,
    pub hops: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dht: Option<DhtConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,
    /// Certificate of the remote pier, used to seal email rendezvous.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,
}

impl GlobalConfig {
    /// Merge global settings with the per-service override.
    ///
    /// `service.pier` must already name a single peer.
    pub fn options_for(&self, service: &ServiceSpec) -> Result<RendezvousOptions> {
        let kind = match service.rendezvous.trim() {
            "" => self.rendezvous,
            "dht" => RendezvousKind::Dht,
            "email" => RendezvousKind::Email,
            other => {
                return Err(Error::Config(format!(
                    "Unknown rendezvous '{other}' for service '{}'",
                    service.name
                )));
            }
        };
        let (dht, email, certificate) = match kind {
            RendezvousKind::Dht => (Some(self.dht.clone()), None, None),
            RendezvousKind::Email => (
                None,
                Some(self.email.clone()),
                Some(self.home.join(&service.pier).join(CERT_FILE)),
            ),
        };
        Ok(RendezvousOptions {
            kind,
            stun: self.nat.stun.clone(),
            hops: self.nat.hops,
            dht,
            email,
            certificate,
        })
    }
}

/// Configuration as read at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub global: GlobalConfig,
    /// Services keyed by the pier whose file declares them.
    pub services: BTreeMap<String, Vec<ServiceSpec>>,
}

impl Snapshot {
    /// Look up the declaration behind `handle`.
    pub fn find(&self, handle: &Handle) -> Option<&ServiceSpec> {
        self.services
            .get(&handle.pier)?
            .iter()
            .find(|spec| spec.name == handle.service)
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.find(handle).is_some()
    }

    /// Every declared service with its handle.
    pub fn declared(&self) -> impl Iterator<Item = (Handle, &ServiceSpec)> {
        self.services.iter().flat_map(|(pier, specs)| {
            specs
                .iter()
                .map(move |spec| (Handle::new(pier.clone(), spec.name.clone()), spec))
        })
    }
}

/// Configuration files under one home directory.
#[derive(Debug, Clone)]
pub struct Repository {
    home: PathBuf,
}

impl Repository {
    pub fn open(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Take the configuration lock; released when the guard drops.
    pub fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.home.join(LOCK_FILE))
    }

    /// Path of the certificate material of `pier`.
    pub fn certificate(&self, pier: &str) -> Result<PathBuf> {
        Ok(self.pier_dir(pier)?.join(CERT_FILE))
    }

    /// Read the global config and every pier's service list.
    ///
    /// The caller holds the configuration lock.
    pub fn load(&self) -> Result<Snapshot> {
        if !self.home.is_dir() {
            return Err(Error::Config(format!(
                "Home directory {} does not exist",
                self.home.display()
            )));
        }

        let global_path = self.home.join(CONFIG_FILE);
        let mut global: GlobalConfig = if global_path.exists() {
            read_json(&global_path)?
        } else {
            GlobalConfig::default()
        };
        global.home.clone_from(&self.home);

        let mut services = BTreeMap::new();
        for owner in subdirectories(&self.home)? {
            for name in subdirectories(&self.home.join(&owner))? {
                let path = self.home.join(&owner).join(&name).join(CONFIG_FILE);
                if !path.is_file() {
                    continue;
                }
                let specs: Vec<ServiceSpec> = read_json(&path)?;
                validate_services(&path, &specs)?;
                services.insert(format!("{owner}/{name}"), specs);
            }
        }

        debug!(
            home = %self.home.display(),
            piers = services.len(),
            "Configuration loaded"
        );
        Ok(Snapshot { global, services })
    }

    /// Replace the global config.
    pub fn save_global(&self, config: &GlobalConfig) -> Result<()> {
        let _lock = self.lock()?;
        write_json(&self.home.join(CONFIG_FILE), config)
    }

    /// Replace the service list of `pier`.
    pub fn save_services(&self, pier: &str, specs: &[ServiceSpec]) -> Result<()> {
        let dir = self.pier_dir(pier)?;
        let path = dir.join(CONFIG_FILE);
        validate_services(&path, specs)?;
        let _lock = self.lock()?;
        fs::create_dir_all(&dir)?;
        write_json(&path, &specs)
    }

    fn pier_dir(&self, pier: &str) -> Result<PathBuf> {
        let parts: Vec<&str> = pier.split('/').collect();
        let valid = parts.len() == 2
            && parts.iter().all(|part| {
                !part.is_empty() && *part != "." && *part != ".." && !part.contains('\\')
            });
        if !valid {
            return Err(Error::Config(format!(
                "Invalid pier '{pier}', expected 'owner/name'"
            )));
        }
        Ok(self.home.join(parts[0]).join(parts[1]))
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn validate_services(path: &Path, specs: &[ServiceSpec]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() || spec.pier.trim().is_empty() {
            return Err(Error::Config(format!(
                "Service without name or pier in {}",
                path.display()
            )));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate service '{}' in {}",
                spec.name,
                path.display()
            )));
        }
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json)?;
    fs::rename(&staging, path)?;
    Ok(())
}
