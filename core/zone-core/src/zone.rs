//! The per-process zone context.
//!
//! One [`ZoneContext`] exists per zone process. It owns the resolved identity,
//! the bootstrap state machine, the handoff engine and every background task
//! (network wait, heartbeat, watchdog). The host loop drives it with
//! [`ZoneContext::tick`]; shutting it down, explicitly or by dropping it,
//! cancels every task it scheduled.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapPhase, ServerBootstrap};
use crate::config::ZoneConfig;
use crate::error::{Result, ZoneError};
use crate::handoff::{HandoffEngine, RedirectPolicy};
use crate::host::RegionServer;
use crate::identity::{LaunchArgs, ZoneRuntimeIdentity};
use crate::liveness::{HeartbeatWriter, Watchdog, WatchdogVerdict};
use crate::scheduler::TaskScheduler;
use crate::store::LivenessStore;
use crate::supervisor::{spawn_sibling_zones, ProcessSpawner, SpawnReport, SpawnSkip};

static PROCESS_SLOT: Lazy<Arc<InstanceSlot>> = Lazy::new(|| Arc::new(InstanceSlot::new()));

/// Admits at most one live zone context at a time.
#[derive(Debug, Default)]
pub struct InstanceSlot {
    claimed: AtomicBool,
}

impl InstanceSlot {
    pub const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
        }
    }

    pub fn process() -> Arc<InstanceSlot> {
        Arc::clone(&PROCESS_SLOT)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Held by the live context; releases the slot on drop.
#[derive(Debug)]
pub struct InstanceClaim {
    slot: Arc<InstanceSlot>,
}

impl InstanceClaim {
    pub fn acquire(slot: &Arc<InstanceSlot>) -> Result<Self> {
        slot.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ZoneError::DuplicateZone)?;
        Ok(Self {
            slot: Arc::clone(slot),
        })
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        self.slot.claimed.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTask {
    AwaitNetwork,
    Heartbeat,
    Watchdog,
}

/// Returned by [`ZoneContext::tick`] when the watchdog gave up on the leader.
/// The caller exits the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub leader_zone_id: String,
    /// `None` when the leader had no usable stamp.
    pub elapsed: Option<Duration>,
    pub timeout: Duration,
}

pub struct ZoneContext {
    config: ZoneConfig,
    launch: LaunchArgs,
    identity: ZoneRuntimeIdentity,
    bootstrap: ServerBootstrap,
    heartbeat: HeartbeatWriter,
    watchdog: Watchdog,
    handoff: HandoffEngine,
    scheduler: TaskScheduler<ZoneTask>,
    siblings_spawned: bool,
    watchdog_armed: bool,
    shut_down: bool,
    _claim: InstanceClaim,
}

impl ZoneContext {
    /// Claims the process-wide slot. Fails with [`ZoneError::DuplicateZone`]
    /// while another context is alive.
    pub fn claim(config: ZoneConfig, launch: LaunchArgs) -> Result<Self> {
        Self::claim_in(&PROCESS_SLOT, config, launch)
    }

    pub fn claim_in(slot: &Arc<InstanceSlot>, config: ZoneConfig, launch: LaunchArgs) -> Result<Self> {
        let claim = InstanceClaim::acquire(slot)?;
        let identity = ZoneRuntimeIdentity::resolve(&launch, &config)?;

        info!(
            region = %identity.region_path(),
            port = identity.assigned_port(),
            leader = identity.is_leader(),
            "Zone identity resolved"
        );

        Ok(Self {
            bootstrap: ServerBootstrap::new(&identity),
            heartbeat: HeartbeatWriter::from_config(&config),
            watchdog: Watchdog::from_config(&config),
            handoff: HandoffEngine::new(identity.region_path(), RedirectPolicy::from_config(&config)),
            scheduler: TaskScheduler::new(),
            siblings_spawned: false,
            watchdog_armed: false,
            shut_down: false,
            config,
            launch,
            identity,
            _claim: claim,
        })
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn launch(&self) -> &LaunchArgs {
        &self.launch
    }

    pub fn identity(&self) -> &ZoneRuntimeIdentity {
        &self.identity
    }

    pub fn handoff(&self) -> &HandoffEngine {
        &self.handoff
    }

    pub fn handoff_mut(&mut self) -> &mut HandoffEngine {
        &mut self.handoff
    }

    pub fn is_scheduled(&self, task: ZoneTask) -> bool {
        self.scheduler.is_scheduled(task)
    }

    /// When the host loop next needs to call [`ZoneContext::tick`].
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.scheduler.earliest_due()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Sets the listen port and, for a sibling, starts waiting for the
    /// network before asking for its region.
    pub fn begin_bootstrap(&mut self, server: &mut dyn RegionServer, now: DateTime<Utc>) {
        if self.shut_down {
            return;
        }
        if self.bootstrap.start(server) {
            self.scheduler.schedule_every(
                ZoneTask::AwaitNetwork,
                now,
                self.config.bootstrap.network_wait_interval(),
            );
        }
    }

    /// Runs once the server is accepting connections. The leader spawns its
    /// siblings and starts its heartbeat; everyone else gets a skipped report.
    pub fn on_server_started(
        &mut self,
        server: &dyn RegionServer,
        spawner: &mut dyn ProcessSpawner,
        now: DateTime<Utc>,
    ) -> SpawnReport {
        if self.shut_down || self.siblings_spawned {
            return SpawnReport {
                skipped: Some(SpawnSkip::AlreadySpawned),
                ..SpawnReport::default()
            };
        }

        let server_active = server.is_server_active();
        let report = spawn_sibling_zones(
            &self.config,
            &self.identity,
            &self.launch,
            &self.identity.region_name(),
            server_active,
            spawner,
        );

        if self.identity.is_leader() && server_active {
            self.siblings_spawned = true;
            info!(
                zone = %self.heartbeat.zone_id(),
                interval_ms = self.heartbeat.interval().num_milliseconds(),
                "Starting leader heartbeat"
            );
            self.scheduler
                .schedule_every(ZoneTask::Heartbeat, now, self.heartbeat.interval());
        }
        report
    }

    /// Arms the watchdog the first time a sibling's own region finishes
    /// loading. Returns whether it was armed by this call.
    pub fn on_region_loaded(&mut self, loaded_region_name: &str, now: DateTime<Utc>) -> bool {
        if self.shut_down || self.identity.is_leader() || self.watchdog_armed {
            return false;
        }
        if loaded_region_name != self.identity.region_name() {
            debug!(loaded = %loaded_region_name, "Loaded region is not this zone's region");
            return false;
        }

        let timeout = self.watchdog.timeout();
        info!(
            leader = %self.watchdog.leader_zone_id(),
            timeout_ms = timeout.num_milliseconds(),
            "Region loaded; starting leader watchdog"
        );
        self.scheduler
            .schedule_every(ZoneTask::Watchdog, now + timeout, timeout);
        self.watchdog_armed = true;
        true
    }

    /// Runs every task due at `now`.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        server: &mut dyn RegionServer,
        store: &dyn LivenessStore,
    ) -> Option<Termination> {
        if self.shut_down {
            return None;
        }

        for task in self.scheduler.take_due(now) {
            match task {
                ZoneTask::AwaitNetwork => match self.bootstrap.poll(server) {
                    Ok(BootstrapPhase::AwaitingNetwork) => {}
                    Ok(_) => {
                        self.scheduler.cancel(ZoneTask::AwaitNetwork);
                    }
                    Err(err) => {
                        error!(error = %err, "Region change request failed");
                        self.scheduler.cancel(ZoneTask::AwaitNetwork);
                    }
                },
                ZoneTask::Heartbeat => {
                    if let Err(err) = self.heartbeat.write(store, now) {
                        warn!(error = %err, "Heartbeat write failed");
                    }
                }
                ZoneTask::Watchdog => match self.watchdog.check(store, now) {
                    Ok(WatchdogVerdict::Alive { elapsed }) => {
                        debug!(elapsed_ms = elapsed.num_milliseconds(), "Leader alive");
                    }
                    Ok(WatchdogVerdict::Expired { elapsed }) => {
                        let timeout = self.watchdog.timeout();
                        error!(
                            leader = %self.watchdog.leader_zone_id(),
                            elapsed_ms = elapsed.map(|e| e.num_milliseconds()),
                            timeout_ms = timeout.num_milliseconds(),
                            "Leader zone offline; terminating"
                        );
                        let termination = Termination {
                            leader_zone_id: self.watchdog.leader_zone_id().to_string(),
                            elapsed,
                            timeout,
                        };
                        self.shutdown();
                        return Some(termination);
                    }
                    Err(err) => {
                        warn!(error = %err, "Watchdog check skipped");
                    }
                },
            }
        }
        None
    }

    /// Cancels every task. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let cancelled = self.scheduler.cancel_all();
        info!(
            region = %self.identity.region_path(),
            cancelled,
            "Zone context shut down"
        );
    }
}

impl Drop for ZoneContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
