//! Sibling zone spawning, run by the leader once its server is up.
//!
//! The leader starts one process per configured region other than its own,
//! passing its own arguments through plus `-scenePath <region>`. Spawning is
//! fire-and-forget: no restarts, no retries. A sibling that dies shows up only
//! as clients failing to connect to its port.

use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use tracing::{error, info, warn};

use crate::config::ZoneConfig;
use crate::error::ZoneError;
use crate::identity::{region_name, LaunchArgs, ZoneRuntimeIdentity};

pub trait ProcessSpawner {
    /// Starts `program` with `args` to serve `region_path`; returns its pid.
    fn spawn(&mut self, region_path: &str, program: &Path, args: &[String]) -> std::io::Result<u32>;
}

/// Spawns real OS processes and keeps their handles so exits can be logged.
#[derive(Debug, Default)]
pub struct CommandSpawner {
    children: Vec<(String, Child)>,
}

impl CommandSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }

    /// Collects siblings that have exited. Nothing is restarted.
    pub fn reap_exited(&mut self) -> Vec<(String, ExitStatus)> {
        let mut exited = Vec::new();
        self.children.retain_mut(|(region, child)| match child.try_wait() {
            Ok(Some(status)) => {
                warn!(region = %region, pid = child.id(), status = %status, "Sibling zone exited");
                exited.push((region.clone(), status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(region = %region, error = %err, "Failed to poll sibling zone");
                true
            }
        });
        exited
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&mut self, region_path: &str, program: &Path, args: &[String]) -> std::io::Result<u32> {
        let child = Command::new(program).args(args).spawn()?;
        let pid = child.id();
        self.children.push((region_path.to_string(), child));
        Ok(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnSkip {
    AlreadySpawned,
    ServerInactive,
    Disabled,
    NotLeader,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedZone {
    pub region_path: String,
    pub pid: u32,
}

#[derive(Debug, Default)]
pub struct SpawnReport {
    pub skipped: Option<SpawnSkip>,
    pub spawned: Vec<SpawnedZone>,
    pub failed: Vec<ZoneError>,
}

/// Spawns one sibling per configured region except `active_region_name`.
///
/// Only the leader of a running dedicated server spawns; every other caller
/// gets a report with `skipped` set. Empty region entries are passed over.
pub fn spawn_sibling_zones(
    config: &ZoneConfig,
    identity: &ZoneRuntimeIdentity,
    launch: &LaunchArgs,
    active_region_name: &str,
    server_active: bool,
    spawner: &mut dyn ProcessSpawner,
) -> SpawnReport {
    let mut report = SpawnReport::default();

    if !server_active {
        report.skipped = Some(SpawnSkip::ServerInactive);
        return report;
    }
    if !config.spawn_siblings {
        report.skipped = Some(SpawnSkip::Disabled);
        return report;
    }
    if !identity.is_leader() {
        report.skipped = Some(SpawnSkip::NotLeader);
        return report;
    }

    let program = launch.executable_path();
    info!(program = %program.display(), "Leader spawning sibling zones");

    for region_path in &config.regions {
        if region_path.trim().is_empty() {
            continue;
        }
        if region_name(region_path) == active_region_name {
            continue;
        }

        let args = launch.sibling_args(region_path);
        info!(
            program = %program.display(),
            args = %args.join(" "),
            "Spawning sibling zone"
        );
        match spawner.spawn(region_path, &program, &args) {
            Ok(pid) => report.spawned.push(SpawnedZone {
                region_path: region_path.clone(),
                pid,
            }),
            Err(source) => {
                let err = ZoneError::Spawn {
                    region: region_path.clone(),
                    source,
                };
                error!(error = %err, "Failed to spawn sibling zone");
                report.failed.push(err);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingSpawner {
        calls: Vec<(String, PathBuf, Vec<String>)>,
        fail_for: Option<String>,
    }

    impl ProcessSpawner for RecordingSpawner {
        fn spawn(
            &mut self,
            region_path: &str,
            program: &Path,
            args: &[String],
        ) -> std::io::Result<u32> {
            if self.fail_for.as_deref() == Some(region_path) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such binary",
                ));
            }
            self.calls
                .push((region_path.to_string(), program.to_path_buf(), args.to_vec()));
            Ok(1000 + self.calls.len() as u32)
        }
    }

    fn config() -> ZoneConfig {
        ZoneConfig {
            regions: vec![
                "Scenes/World1.unity".to_string(),
                "".to_string(),
                "Scenes/World2.unity".to_string(),
                "Scenes/World3.unity".to_string(),
            ],
            ..ZoneConfig::default()
        }
    }

    fn leader_launch() -> LaunchArgs {
        LaunchArgs::new("zone-node", vec!["-batchmode".to_string()])
    }

    fn leader(config: &ZoneConfig) -> ZoneRuntimeIdentity {
        ZoneRuntimeIdentity::resolve(&leader_launch(), config).expect("identity")
    }

    #[test]
    fn spawns_every_other_region_with_forwarded_args() {
        let config = config();
        let mut spawner = RecordingSpawner::default();
        let report = spawn_sibling_zones(
            &config,
            &leader(&config),
            &leader_launch(),
            "World1",
            true,
            &mut spawner,
        );

        assert!(report.skipped.is_none());
        assert_eq!(report.spawned.len(), 2);
        let regions: Vec<&str> = spawner.calls.iter().map(|c| c.0.as_str()).collect();
        assert_eq!(regions, vec!["Scenes/World2.unity", "Scenes/World3.unity"]);
        assert_eq!(
            spawner.calls[0].2,
            vec!["-batchmode", "-scenePath", "Scenes/World2.unity"]
        );
    }

    #[test]
    fn siblings_never_spawn() {
        let config = config();
        let launch = LaunchArgs::new(
            "zone-node",
            vec!["-scenePath".to_string(), "Scenes/World2.unity".to_string()],
        );
        let identity = ZoneRuntimeIdentity::resolve(&launch, &config).expect("identity");
        let mut spawner = RecordingSpawner::default();
        let report =
            spawn_sibling_zones(&config, &identity, &launch, "World2", true, &mut spawner);
        assert_eq!(report.skipped, Some(SpawnSkip::NotLeader));
        assert!(spawner.calls.is_empty());
    }

    #[test]
    fn inactive_server_never_spawns() {
        let config = config();
        let mut spawner = RecordingSpawner::default();
        let report = spawn_sibling_zones(
            &config,
            &leader(&config),
            &leader_launch(),
            "World1",
            false,
            &mut spawner,
        );
        assert_eq!(report.skipped, Some(SpawnSkip::ServerInactive));
        assert!(spawner.calls.is_empty());
    }

    #[test]
    fn disabled_spawning_is_skipped() {
        let mut config = config();
        config.spawn_siblings = false;
        let mut spawner = RecordingSpawner::default();
        let report = spawn_sibling_zones(
            &config,
            &leader(&config),
            &leader_launch(),
            "World1",
            true,
            &mut spawner,
        );
        assert_eq!(report.skipped, Some(SpawnSkip::Disabled));
    }

    #[test]
    fn failed_spawn_is_reported_not_retried() {
        let config = config();
        let mut spawner = RecordingSpawner {
            fail_for: Some("Scenes/World2.unity".to_string()),
            ..RecordingSpawner::default()
        };
        let report = spawn_sibling_zones(
            &config,
            &leader(&config),
            &leader_launch(),
            "World1",
            true,
            &mut spawner,
        );
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0],
            ZoneError::Spawn { region, .. } if region == "Scenes/World2.unity"
        ));
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(spawner.calls.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn command_spawner_reaps_exited_siblings() {
        let mut spawner = CommandSpawner::new();
        let pid = spawner
            .spawn(
                "Scenes/World2.unity",
                Path::new("/bin/sh"),
                &["-c".to_string(), "exit 3".to_string()],
            )
            .expect("spawn");
        assert!(pid > 0);
        assert_eq!(spawner.running(), 1);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let exited = loop {
            let exited = spawner.reap_exited();
            if !exited.is_empty() {
                break exited;
            }
            assert!(std::time::Instant::now() < deadline, "child never exited");
            std::thread::sleep(std::time::Duration::from_millis(20));
        };
        assert_eq!(exited[0].0, "Scenes/World2.unity");
        assert_eq!(exited[0].1.code(), Some(3));
        assert_eq!(spawner.running(), 0);
    }

    #[test]
    fn command_spawner_keeps_nothing_when_spawn_fails() {
        let mut spawner = CommandSpawner::new();
        let result = spawner.spawn(
            "Scenes/World2.unity",
            Path::new("/nonexistent/zone-node"),
            &[],
        );
        assert!(result.is_err());
        assert_eq!(spawner.running(), 0);
    }
}
