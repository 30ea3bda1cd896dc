use std::{
    collections::HashSet,
    fs, io,
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "pilot.toml";
pub const CURRENT_CONFIG_VERSION: u32 = 2;

const APPLICATION_DIRECTORY: &str = "proxy-pilot";
const WRITE_PROBE_NAME: &str = ".write-probe";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub config_version: u32,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_outbound: Option<String>,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub inbound: InboundSettings,
    #[serde(default)]
    pub statistics: Statistics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<Outbound>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineSettings {
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_launch_timeout_ms() -> u64 {
    3000
}

fn default_call_timeout_ms() -> u64 {
    1000
}

fn default_terminate_grace_ms() -> u64 {
    3000
}

fn default_health_interval_ms() -> u64 {
    2000
}

fn default_health_failure_threshold() -> u32 {
    2
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            arguments: Vec::new(),
            log_level: default_log_level(),
            launch_timeout_ms: default_launch_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            health_interval_ms: default_health_interval_ms(),
            health_failure_threshold: default_health_failure_threshold(),
        }
    }
}

impl EngineSettings {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Outbound {
    pub fn direct(tag: &str) -> Self {
        Self {
            tag: tag.into(),
            protocol: "freedom".into(),
            address: String::new(),
            port: 0,
            username: None,
            password: None,
            id: None,
        }
    }

    /// Protocols other than `freedom` and `blackhole` dial a remote endpoint.
    pub fn requires_endpoint(&self) -> bool {
        !matches!(self.protocol.as_str(), "freedom" | "blackhole")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RoutingRule {
    pub outbound: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ip_cidrs: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Subscription {
    pub name: String,
    pub url: String,
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_update_interval_hours() -> u32 {
    24
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Statistics {
    #[serde(default)]
    pub uplink_bytes: u64,
    #[serde(default)]
    pub downlink_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl Configuration {
    pub fn default_template() -> Self {
        Self {
            config_version: CURRENT_CONFIG_VERSION,
            auto_connect: false,
            selected_outbound: Some("direct".into()),
            engine: EngineSettings::default(),
            inbound: InboundSettings {
                socks: Some("127.0.0.1:1080".into()),
                http: Some("127.0.0.1:8889".into()),
            },
            statistics: Statistics::default(),
            outbounds: vec![
                Outbound::direct("direct"),
                Outbound {
                    protocol: "blackhole".into(),
                    ..Outbound::direct("block")
                },
            ],
            rules: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let corrupt = |reason: String| Error::ConfigCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(Error::ConfigIncompatible {
                path: path.to_path_buf(),
                found: self.config_version,
                supported: CURRENT_CONFIG_VERSION,
            });
        }

        let mut tags = HashSet::new();
        for outbound in &self.outbounds {
            if outbound.tag.trim().is_empty() {
                return Err(corrupt("outbound with empty tag".into()));
            }
            if outbound.protocol.trim().is_empty() {
                return Err(corrupt(format!(
                    "outbound '{}' has no protocol",
                    outbound.tag
                )));
            }
            if !tags.insert(outbound.tag.as_str()) {
                return Err(corrupt(format!("duplicate outbound tag '{}'", outbound.tag)));
            }
        }

        if let Some(selected) = &self.selected_outbound
            && !tags.contains(selected.as_str())
        {
            return Err(corrupt(format!(
                "selected outbound '{selected}' does not exist"
            )));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if !tags.contains(rule.outbound.as_str()) {
                return Err(corrupt(format!(
                    "rule #{index} routes to unknown outbound '{}'",
                    rule.outbound
                )));
            }
        }

        for (name, address) in [
            ("socks", &self.inbound.socks),
            ("http", &self.inbound.http),
        ] {
            if let Some(address) = address
                && address.parse::<SocketAddr>().is_err()
            {
                return Err(corrupt(format!(
                    "inbound {name} address '{address}' is not a socket address"
                )));
            }
        }

        let engine = &self.engine;
        if engine.launch_timeout_ms == 0
            || engine.call_timeout_ms == 0
            || engine.terminate_grace_ms == 0
            || engine.health_interval_ms == 0
        {
            return Err(corrupt("engine timeouts must be greater than zero".into()));
        }
        if engine.health_failure_threshold == 0 {
            return Err(corrupt(
                "engine health_failure_threshold must be at least 1".into(),
            ));
        }

        for subscription in &self.subscriptions {
            if subscription.name.trim().is_empty() || subscription.url.trim().is_empty() {
                return Err(corrupt("subscription requires a name and a url".into()));
            }
        }

        Ok(())
    }

    pub fn engine_payload(&self) -> EngineConfig {
        EngineConfig {
            log_level: self.engine.log_level.clone(),
            inbound: self.inbound.clone(),
            outbounds: self.outbounds.clone(),
            rules: self.rules.clone(),
            selected_outbound: self.selected_outbound.clone(),
        }
    }
}

/// What the engine receives in `SetConfig`; controller-only sections stay local.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub log_level: String,
    pub inbound: InboundSettings,
    pub outbounds: Vec<Outbound>,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_outbound: Option<String>,
}

impl EngineConfig {
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| value.as_ref().map(|secret| "*".repeat(secret.len()));
        let mut redacted = self.clone();
        for outbound in &mut redacted.outbounds {
            outbound.password = mask(&outbound.password);
            outbound.id = mask(&outbound.id);
        }
        redacted
    }
}

pub struct ConfigStore {
    directory: PathBuf,
    path: PathBuf,
}

impl ConfigStore {
    pub fn open(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            path: directory.join(CONFIG_FILE_NAME),
        }
    }

    pub fn locate_or_create(override_directory: Option<&Path>) -> Result<Self> {
        let candidates = candidate_directories(override_directory);
        for directory in &candidates {
            let path = directory.join(CONFIG_FILE_NAME);
            if path.is_file() {
                log::info!("[config] found configuration at {}", path.display());
                check_writable(directory).map_err(|error| Error::ConfigMissing {
                    reason: format!("{} is not writable: {error}", directory.display()),
                })?;
                return Ok(Self::open(directory));
            }
            log::debug!("[config] no configuration in {}", directory.display());
        }

        let target = override_directory
            .map(Path::to_path_buf)
            .or_else(|| dirs::config_dir().map(|directory| directory.join(APPLICATION_DIRECTORY)))
            .or_else(|| candidates.last().cloned())
            .ok_or_else(|| Error::ConfigMissing {
                reason: "no candidate configuration directory".into(),
            })?;

        fs::create_dir_all(&target).map_err(|error| Error::ConfigMissing {
            reason: format!("failed to create {}: {error}", target.display()),
        })?;
        check_writable(&target).map_err(|error| Error::ConfigMissing {
            reason: format!("{} is not writable: {error}", target.display()),
        })?;

        let store = Self::open(&target);
        store
            .save(&Configuration::default_template())
            .map_err(|error| Error::ConfigMissing {
                reason: error.to_string(),
            })?;
        log::info!(
            "[config] created default configuration at {}",
            store.path.display()
        );
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logs_directory(&self) -> PathBuf {
        self.directory.join("logs")
    }

    pub fn load(&self) -> Result<Configuration> {
        Self::load_from(&self.path)
    }

    pub fn load_from(path: &Path) -> Result<Configuration> {
        let content = fs::read_to_string(path).map_err(|error| Error::ConfigCorrupt {
            path: path.to_path_buf(),
            reason: format!("cannot read: {error}"),
        })?;
        let configuration = parse_configuration(&content, path)?;
        log::info!(
            "[config] loaded {} ({} outbounds, {} rules, {} subscriptions)",
            path.display(),
            configuration.outbounds.len(),
            configuration.rules.len(),
            configuration.subscriptions.len(),
        );
        Ok(configuration)
    }

    pub fn save(&self, configuration: &Configuration) -> Result<()> {
        let write_failed = |reason: String| Error::ConfigWriteFailed {
            path: self.path.clone(),
            reason,
        };
        let content = toml::to_string_pretty(configuration)
            .map_err(|error| write_failed(format!("serialization failed: {error}")))?;
        write_atomically(&self.path, content.as_bytes())
            .map_err(|error| write_failed(error.to_string()))?;
        log::debug!("[config] saved {}", self.path.display());
        Ok(())
    }
}

pub fn candidate_directories(override_directory: Option<&Path>) -> Vec<PathBuf> {
    if let Some(directory) = override_directory {
        return vec![directory.to_path_buf()];
    }

    let mut candidates = Vec::new();
    if let Ok(executable) = std::env::current_exe()
        && let Some(parent) = executable.parent()
    {
        candidates.push(parent.join("config"));
    }
    if let Some(directory) = dirs::config_dir() {
        candidates.push(directory.join(APPLICATION_DIRECTORY));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(format!(".{APPLICATION_DIRECTORY}")));
    }
    candidates
}

fn check_writable(directory: &Path) -> io::Result<()> {
    let probe = directory.join(WRITE_PROBE_NAME);
    fs::write(&probe, b"probe")?;
    fs::remove_file(&probe)
}

fn parse_configuration(content: &str, path: &Path) -> Result<Configuration> {
    let corrupt = |reason: String| Error::ConfigCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut document: toml::Table = content
        .parse()
        .map_err(|error: toml::de::Error| corrupt(error.message().to_string()))?;

    let version = match document.get("config_version") {
        Some(toml::Value::Integer(version)) => *version,
        Some(_) => return Err(corrupt("config_version must be an integer".into())),
        None => return Err(corrupt("missing config_version".into())),
    };

    if version <= 0 || version > i64::from(CURRENT_CONFIG_VERSION) {
        return Err(Error::ConfigIncompatible {
            path: path.to_path_buf(),
            found: u32::try_from(version).unwrap_or(0),
            supported: CURRENT_CONFIG_VERSION,
        });
    }

    if version < i64::from(CURRENT_CONFIG_VERSION) {
        log::info!(
            "[config] migrating {} from version {version} to {CURRENT_CONFIG_VERSION}",
            path.display()
        );
        migrate(&mut document, version);
    }

    let configuration: Configuration = toml::Value::Table(document)
        .try_into()
        .map_err(|error: toml::de::Error| corrupt(error.message().to_string()))?;
    configuration.validate(path)?;
    Ok(configuration)
}

fn migrate(document: &mut toml::Table, from_version: i64) {
    // v1 stored bare listener ports instead of socket addresses.
    if from_version < 2
        && let Some(toml::Value::Table(inbound)) = document.get_mut("inbound")
    {
        for (legacy, current) in [("socks_port", "socks"), ("http_port", "http")] {
            if let Some(toml::Value::Integer(port)) = inbound.remove(legacy) {
                inbound.insert(
                    current.into(),
                    toml::Value::String(format!("127.0.0.1:{port}")),
                );
            }
        }
    }

    document.insert(
        "config_version".into(),
        toml::Value::Integer(i64::from(CURRENT_CONFIG_VERSION)),
    );
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(CONFIG_FILE_NAME);
    let temporary = directory.join(format!(".{file_name}.tmp"));

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&temporary)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temporary, path)?;
        #[cfg(unix)]
        if let Ok(handle) = fs::File::open(directory) {
            let _ = handle.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temporary);
    }
    result
}
