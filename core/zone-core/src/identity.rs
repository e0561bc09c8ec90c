//! Zone identity: which region this process serves and on which port.
//!
//! A process launched with `-scenePath <region>` is a sibling zone serving
//! that region. A process launched without it is the leader. Ports come from
//! the configured region order (`base_port + index`), which is the only thing
//! keeping two zones off the same endpoint.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::ZoneConfig;
use crate::error::{Result, ZoneError};

pub const REGION_SELECTOR_ARG: &str = "-scenePath";

/// The arguments this process was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    program: String,
    args: Vec<String>,
}

impl LaunchArgs {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_env() -> Self {
        let mut raw = env::args_os().map(|arg| arg.to_string_lossy().into_owned());
        let program = raw.next().unwrap_or_default();
        Self {
            program,
            args: raw.collect(),
        }
    }

    /// Value following the first occurrence of `flag`, if there is one.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let index = self.args.iter().position(|arg| arg == flag)?;
        self.args.get(index + 1).map(String::as_str)
    }

    pub fn region_selector(&self) -> Option<&str> {
        self.value_of(REGION_SELECTOR_ARG)
            .filter(|value| !value.trim().is_empty())
    }

    /// Everything after the program name, untouched.
    pub fn forwarded(&self) -> &[String] {
        &self.args
    }

    pub fn args_string(&self) -> String {
        self.args.join(" ")
    }

    /// Path used to respawn this executable.
    pub fn executable_path(&self) -> PathBuf {
        env::current_exe().unwrap_or_else(|_| PathBuf::from(&self.program))
    }

    pub fn sibling_args(&self, region_path: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(REGION_SELECTOR_ARG.to_string());
        args.push(region_path.to_string());
        args
    }
}

/// Region name as used for region changes and loaded notifications: the file
/// stem of the region path (`Scenes/World2.unity` -> `World2`).
pub fn region_name(region_path: &str) -> String {
    Path::new(region_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Deterministic region -> port mapping shared by servers and clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    base_port: u16,
    regions: Vec<String>,
}

impl PortMap {
    pub fn from_config(config: &ZoneConfig) -> Self {
        Self {
            base_port: config.base_port,
            regions: config.regions.clone(),
        }
    }

    pub fn port_for_path(&self, region_path: &str) -> Result<u16> {
        if region_path.trim().is_empty() {
            return Err(ZoneError::UnknownRegion(region_path.to_string()));
        }
        let index = self
            .regions
            .iter()
            .position(|path| path == region_path)
            .ok_or_else(|| ZoneError::UnknownRegion(region_path.to_string()))?;
        self.port_for_index(index)
    }

    pub fn port_for_name(&self, name: &str) -> Result<u16> {
        let index = self
            .regions
            .iter()
            .position(|path| !path.trim().is_empty() && region_name(path) == name)
            .ok_or_else(|| ZoneError::UnknownRegion(name.to_string()))?;
        self.port_for_index(index)
    }

    fn port_for_index(&self, index: usize) -> Result<u16> {
        u16::try_from(index)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or(ZoneError::PortOverflow {
                base_port: self.base_port,
                index,
            })
    }
}

/// Fixed for the lifetime of the process once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRuntimeIdentity {
    selected_region_path: Option<String>,
    region_path: String,
    assigned_port: u16,
}

impl ZoneRuntimeIdentity {
    pub fn resolve(launch: &LaunchArgs, config: &ZoneConfig) -> Result<Self> {
        let selected = launch.region_selector().map(str::to_string);
        let region_path = selected
            .clone()
            .unwrap_or_else(|| config.home_region().to_string());
        let assigned_port = PortMap::from_config(config).port_for_path(&region_path)?;

        Ok(Self {
            selected_region_path: selected,
            region_path,
            assigned_port,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.selected_region_path.is_none()
    }

    pub fn selected_region_path(&self) -> Option<&str> {
        self.selected_region_path.as_deref()
    }

    /// The region this process serves: the selected one, or the home region
    /// for the leader.
    pub fn region_path(&self) -> &str {
        &self.region_path
    }

    pub fn region_name(&self) -> String {
        region_name(&self.region_path)
    }

    pub fn assigned_port(&self) -> u16 {
        self.assigned_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn args(values: &[&str]) -> LaunchArgs {
        LaunchArgs::new(
            "/opt/world/zone-node",
            values.iter().map(|value| value.to_string()).collect(),
        )
    }

    fn config(regions: &[&str]) -> ZoneConfig {
        ZoneConfig {
            regions: regions.iter().map(|value| value.to_string()).collect(),
            ..ZoneConfig::default()
        }
    }

    #[test]
    fn finds_region_selector() {
        let launch = args(&["-batchmode", "-scenePath", "Scenes/World2.unity"]);
        assert_eq!(launch.region_selector(), Some("Scenes/World2.unity"));
    }

    #[test]
    fn selector_without_value_means_leader() {
        assert_eq!(args(&["-batchmode", "-scenePath"]).region_selector(), None);
        assert_eq!(args(&["-batchmode"]).region_selector(), None);
        assert_eq!(args(&[]).region_selector(), None);
    }

    #[test]
    fn sibling_args_forward_everything() {
        let launch = args(&["-batchmode", "-config", "/etc/zones.toml"]);
        assert_eq!(
            launch.sibling_args("Scenes/World2.unity"),
            vec![
                "-batchmode",
                "-config",
                "/etc/zones.toml",
                "-scenePath",
                "Scenes/World2.unity"
            ]
        );
        assert_eq!(launch.args_string(), "-batchmode -config /etc/zones.toml");
    }

    #[test]
    fn region_name_is_file_stem() {
        assert_eq!(region_name("Assets/Scenes/World2.unity"), "World2");
        assert_eq!(region_name("World1.unity"), "World1");
        assert_eq!(region_name(""), "");
    }

    #[test]
    fn leader_serves_home_region() {
        let config = config(&["Scenes/World1.unity", "Scenes/World2.unity"]);
        let identity = ZoneRuntimeIdentity::resolve(&args(&[]), &config).expect("resolve");
        assert!(identity.is_leader());
        assert_eq!(identity.region_path(), "Scenes/World1.unity");
        assert_eq!(identity.assigned_port(), 7777);
    }

    #[test]
    fn sibling_port_is_base_plus_index() {
        let config = config(&["Scenes/World1.unity", "Scenes/World2.unity"]);
        let identity = ZoneRuntimeIdentity::resolve(
            &args(&["-scenePath", "Scenes/World2.unity"]),
            &config,
        )
        .expect("resolve");
        assert!(!identity.is_leader());
        assert_eq!(identity.region_name(), "World2");
        assert_eq!(identity.assigned_port(), 7778);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let config = config(&["Scenes/World1.unity"]);
        let result =
            ZoneRuntimeIdentity::resolve(&args(&["-scenePath", "Scenes/Moon.unity"]), &config);
        assert!(matches!(result, Err(ZoneError::UnknownRegion(_))));
    }

    #[test]
    fn ports_are_pairwise_distinct() {
        for count in 1..=32 {
            let regions: Vec<String> = (0..count)
                .map(|index| format!("Scenes/Region{}.unity", index))
                .collect();
            let config = ZoneConfig {
                regions: regions.clone(),
                ..ZoneConfig::default()
            };
            let map = PortMap::from_config(&config);
            let ports: HashSet<u16> = regions
                .iter()
                .map(|path| map.port_for_path(path).expect("port"))
                .collect();
            assert_eq!(ports.len(), count);
        }
    }

    #[test]
    fn port_lookup_by_name_matches_path() {
        let config = config(&["Scenes/World1.unity", "", "Scenes/World2.unity"]);
        let map = PortMap::from_config(&config);
        assert_eq!(map.port_for_name("World2").expect("port"), 7779);
        assert_eq!(
            map.port_for_path("Scenes/World2.unity").expect("port"),
            7779
        );
        assert!(map.port_for_name("").is_err());
    }

    #[test]
    fn port_overflow_is_reported() {
        let config = ZoneConfig {
            base_port: u16::MAX,
            regions: vec!["A.unity".to_string(), "B.unity".to_string()],
            ..ZoneConfig::default()
        };
        let map = PortMap::from_config(&config);
        assert_eq!(map.port_for_path("A.unity").expect("port"), u16::MAX);
        assert!(matches!(
            map.port_for_path("B.unity"),
            Err(ZoneError::PortOverflow { .. })
        ));
    }
}
