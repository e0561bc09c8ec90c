//! Zone configuration loading.
//!
//! One TOML file describes the whole world: the ordered region list (which
//! doubles as the port map), liveness timing, redirect policy and portals.
//! Every zone process reads the same file; the leader forwards `-config` to
//! its siblings along with the rest of its arguments.

use chrono::Duration;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use crate::error::{Result, ZoneError};
use crate::identity::{region_name, LaunchArgs};

pub const CONFIG_ARG: &str = "-config";
pub const CONFIG_ENV: &str = "ZONEWEAVE_CONFIG";
const DATA_DIR_NAME: &str = ".zoneweave";
const CONFIG_FILE_NAME: &str = "zones.toml";
const DATABASE_FILE_NAME: &str = "zones.db";

const WRITE_INTERVAL_RANGE_SECS: (f64, f64) = (1.0, 10.0);
const TIMEOUT_MULTIPLIER_RANGE: (f64, f64) = (2.0, 10.0);
const NETWORK_WAIT_RANGE_MS: (u64, u64) = (1, 60_000);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// Name of the leader's liveness row.
    #[serde(default = "default_zone_id")]
    pub zone_id: String,
    /// Ordered region list. A region's position is its port offset.
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    #[serde(default)]
    pub home_region: Option<String>,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub spawn_siblings: bool,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub portals: Vec<PortalConfig>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            zone_id: default_zone_id(),
            regions: default_regions(),
            home_region: None,
            base_port: default_base_port(),
            bind_address: default_bind_address(),
            data_dir: None,
            database_path: None,
            spawn_siblings: true,
            liveness: LivenessConfig::default(),
            bootstrap: BootstrapConfig::default(),
            redirect: RedirectConfig::default(),
            portals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    #[serde(default = "default_write_interval_secs")]
    pub write_interval_secs: f64,
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            write_interval_secs: default_write_interval_secs(),
            timeout_multiplier: default_timeout_multiplier(),
        }
    }
}

impl LivenessConfig {
    pub fn write_interval(&self) -> Duration {
        seconds_to_duration(self.write_interval_secs)
    }

    /// How stale the leader's stamp may get before a sibling gives up.
    pub fn timeout_interval(&self) -> Duration {
        seconds_to_duration(self.write_interval_secs * self.timeout_multiplier)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    #[serde(default = "default_network_wait_interval_ms")]
    pub network_wait_interval_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            network_wait_interval_ms: default_network_wait_interval_ms(),
        }
    }
}

impl BootstrapConfig {
    pub fn network_wait_interval(&self) -> Duration {
        let (_, max_wait) = NETWORK_WAIT_RANGE_MS;
        Duration::milliseconds(self.network_wait_interval_ms.min(max_wait) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    /// Refuse to send or follow redirects to regions missing from `regions`.
    #[serde(default = "default_true")]
    pub validate_target: bool,
    /// When set, servers sign redirects and clients drop unsigned ones.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            validate_target: true,
            shared_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PortalConfig {
    pub name: String,
    pub region: String,
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub destination: String,
    #[serde(default)]
    pub arrival: [f32; 3],
}

impl ZoneConfig {
    pub fn home_region(&self) -> &str {
        match self.home_region.as_deref() {
            Some(home) => home,
            None => self
                .regions
                .iter()
                .find(|path| !path.trim().is_empty())
                .map(String::as_str)
                .unwrap_or(""),
        }
    }

    pub fn region_index(&self, region_path: &str) -> Option<usize> {
        if region_path.trim().is_empty() {
            return None;
        }
        self.regions.iter().position(|path| path == region_path)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir().ok_or(ZoneError::HomeDirNotFound)?;
        Ok(home.join(DATA_DIR_NAME))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join(DATABASE_FILE_NAME)),
        }
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.zone_id.trim().is_empty() {
            return Err(ZoneError::ConfigInvalid("zone_id is required".to_string()));
        }

        let (min_write, max_write) = WRITE_INTERVAL_RANGE_SECS;
        let write = self.liveness.write_interval_secs;
        if !(min_write..=max_write).contains(&write) {
            return Err(ZoneError::ConfigInvalid(format!(
                "liveness.write_interval_secs must be within [{}, {}], got {}",
                min_write, max_write, write
            )));
        }
        let (min_mult, max_mult) = TIMEOUT_MULTIPLIER_RANGE;
        let multiplier = self.liveness.timeout_multiplier;
        if !(min_mult..=max_mult).contains(&multiplier) {
            return Err(ZoneError::ConfigInvalid(format!(
                "liveness.timeout_multiplier must be within [{}, {}], got {}",
                min_mult, max_mult, multiplier
            )));
        }
        let (min_wait, max_wait) = NETWORK_WAIT_RANGE_MS;
        let wait = self.bootstrap.network_wait_interval_ms;
        if !(min_wait..=max_wait).contains(&wait) {
            return Err(ZoneError::ConfigInvalid(format!(
                "bootstrap.network_wait_interval_ms must be within [{}, {}], got {}",
                min_wait, max_wait, wait
            )));
        }

        let mut seen_paths = HashSet::new();
        let mut seen_names = HashSet::new();
        for path in self.regions.iter().filter(|path| !path.trim().is_empty()) {
            if !seen_paths.insert(path.as_str()) {
                return Err(ZoneError::ConfigInvalid(format!(
                    "region listed twice: {}",
                    path
                )));
            }
            let name = region_name(path);
            if !seen_names.insert(name.clone()) {
                return Err(ZoneError::ConfigInvalid(format!(
                    "two regions share the name {}",
                    name
                )));
            }
        }
        if seen_paths.is_empty() {
            return Err(ZoneError::ConfigInvalid(
                "at least one region is required".to_string(),
            ));
        }

        let last_index = self.regions.len() - 1;
        if usize::from(self.base_port) + last_index > usize::from(u16::MAX) {
            return Err(ZoneError::PortOverflow {
                base_port: self.base_port,
                index: last_index,
            });
        }

        let home = self.home_region();
        if self.region_index(home).is_none() {
            return Err(ZoneError::UnknownRegion(home.to_string()));
        }

        for portal in &self.portals {
            if self.region_index(&portal.region).is_none() {
                return Err(ZoneError::ConfigInvalid(format!(
                    "portal {} sits in unknown region {}",
                    portal.name, portal.region
                )));
            }
            if self.region_index(&portal.destination).is_none() {
                return Err(ZoneError::ConfigInvalid(format!(
                    "portal {} leads to unknown region {}",
                    portal.name, portal.destination
                )));
            }
            if (0..3).any(|axis| portal.min[axis] > portal.max[axis]) {
                return Err(ZoneError::ConfigInvalid(format!(
                    "portal {} has min greater than max",
                    portal.name
                )));
            }
        }

        Ok(())
    }
}

/// Resolves the config path: `-config <path>`, then `ZONEWEAVE_CONFIG`, then
/// `~/.zoneweave/zones.toml`.
pub fn resolve_config_path(launch: &LaunchArgs) -> Result<PathBuf> {
    if let Some(path) = launch.value_of(CONFIG_ARG) {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ZoneError::HomeDirNotFound)?;
    Ok(home.join(DATA_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Loads and validates the config. A missing file yields the defaults.
pub fn load_config(path: &std::path::Path) -> Result<ZoneConfig> {
    let config = if path.exists() {
        let content = fs_err::read_to_string(path).map_err(|source| ZoneError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<ZoneConfig>(&content).map_err(|err| ZoneError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?
    } else {
        ZoneConfig::default()
    };

    config.validate()?;
    Ok(config)
}

fn seconds_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

fn default_zone_id() -> String {
    "World1".to_string()
}

fn default_regions() -> Vec<String> {
    vec!["Scenes/World1.unity".to_string()]
}

fn default_base_port() -> u16 {
    7777
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_write_interval_secs() -> f64 {
    1.0
}

fn default_timeout_multiplier() -> f64 {
    3.0
}

fn default_network_wait_interval_ms() -> u64 {
    250
}
