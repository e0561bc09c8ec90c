//! Leader heartbeat and sibling watchdog.
//!
//! The leader stamps its liveness row every write interval. Siblings read it
//! every `write_interval * timeout_multiplier` and give up as soon as the
//! stamp is older than that, or missing. Absence of a leader is only ever
//! inferred from stamp age; the leader never writes an explicit offline
//! marker when it stops.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::ZoneConfig;
use crate::error::Result;
use crate::store::LivenessStore;

#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    zone_id: String,
    interval: Duration,
}

impl HeartbeatWriter {
    pub fn new(zone_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            zone_id: zone_id.into(),
            interval,
        }
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        Self::new(config.zone_id.clone(), config.liveness.write_interval())
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn write(&self, store: &dyn LivenessStore, now: DateTime<Utc>) -> Result<()> {
        store.save_zone_online_time(&self.zone_id, now)?;
        debug!(zone = %self.zone_id, at = %now, "Leader heartbeat written");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Alive { elapsed: Duration },
    /// `elapsed` is `None` when there was no usable stamp at all.
    Expired { elapsed: Option<Duration> },
}

impl WatchdogVerdict {
    pub fn is_expired(&self) -> bool {
        matches!(self, WatchdogVerdict::Expired { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    leader_zone_id: String,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(leader_zone_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            leader_zone_id: leader_zone_id.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        Self::new(config.zone_id.clone(), config.liveness.timeout_interval())
    }

    pub fn leader_zone_id(&self) -> &str {
        &self.leader_zone_id
    }

    /// Also the polling interval.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn check(&self, store: &dyn LivenessStore, now: DateTime<Utc>) -> Result<WatchdogVerdict> {
        let elapsed = store.time_elapsed_since_zone_online(&self.leader_zone_id, now)?;
        Ok(self.judge(elapsed))
    }

    pub fn judge(&self, elapsed: Option<Duration>) -> WatchdogVerdict {
        match elapsed {
            Some(elapsed) if elapsed <= self.timeout => WatchdogVerdict::Alive { elapsed },
            elapsed => WatchdogVerdict::Expired { elapsed },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ZoneOnline;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryLiveness {
        rows: RefCell<HashMap<String, String>>,
    }

    impl LivenessStore for MemoryLiveness {
        fn save_zone_online_time(&self, zone: &str, at: DateTime<Utc>) -> Result<()> {
            self.rows.borrow_mut().insert(
                zone.to_string(),
                crate::store::format_online_timestamp(at),
            );
            Ok(())
        }

        fn zone_online_time(&self, zone: &str) -> Result<ZoneOnline> {
            Ok(match self.rows.borrow().get(zone) {
                Some(value) => ZoneOnline::from_stored(value),
                None => ZoneOnline::Missing,
            })
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn heartbeat_writes_leader_row() {
        let store = MemoryLiveness::default();
        let writer = HeartbeatWriter::new("World1", Duration::seconds(1));
        let now = at("2024-01-01T00:00:00Z");
        writer.write(&store, now).expect("write");
        assert_eq!(
            store.zone_online_time("World1").expect("read"),
            ZoneOnline::Online(now)
        );
    }

    #[test]
    fn fresh_stamp_keeps_sibling_alive() {
        let store = MemoryLiveness::default();
        let start = at("2024-01-01T00:00:00Z");
        HeartbeatWriter::new("World1", Duration::seconds(1))
            .write(&store, start)
            .expect("write");

        let watchdog = Watchdog::new("World1", Duration::seconds(3));
        let verdict = watchdog
            .check(&store, start + Duration::milliseconds(500))
            .expect("check");
        assert_eq!(
            verdict,
            WatchdogVerdict::Alive {
                elapsed: Duration::milliseconds(500)
            }
        );
    }

    #[test]
    fn stale_stamp_expires() {
        let store = MemoryLiveness::default();
        let start = at("2024-01-01T00:00:00Z");
        HeartbeatWriter::new("World1", Duration::seconds(1))
            .write(&store, start)
            .expect("write");

        let watchdog = Watchdog::new("World1", Duration::seconds(3));
        let verdict = watchdog
            .check(&store, start + Duration::seconds(10))
            .expect("check");
        assert_eq!(
            verdict,
            WatchdogVerdict::Expired {
                elapsed: Some(Duration::seconds(10))
            }
        );
    }

    #[test]
    fn missing_or_malformed_stamp_expires() {
        let store = MemoryLiveness::default();
        let watchdog = Watchdog::new("World1", Duration::seconds(3));
        let now = at("2024-01-01T00:00:00Z");
        assert!(watchdog.check(&store, now).expect("check").is_expired());

        store
            .rows
            .borrow_mut()
            .insert("World1".to_string(), "garbage".to_string());
        assert_eq!(
            watchdog.check(&store, now).expect("check"),
            WatchdogVerdict::Expired { elapsed: None }
        );
    }

    #[test]
    fn timeout_boundary_is_inclusive_of_alive() {
        let watchdog = Watchdog::new("World1", Duration::seconds(3));
        assert!(!watchdog.judge(Some(Duration::seconds(3))).is_expired());
        assert!(watchdog
            .judge(Some(Duration::milliseconds(3001)))
            .is_expired());
    }

    #[test]
    fn from_config_uses_multiplied_interval() {
        let mut config = ZoneConfig::default();
        config.liveness.write_interval_secs = 2.0;
        config.liveness.timeout_multiplier = 2.5;
        let watchdog = Watchdog::from_config(&config);
        assert_eq!(watchdog.timeout(), Duration::seconds(5));
        assert_eq!(watchdog.leader_zone_id(), "World1");
        assert_eq!(
            HeartbeatWriter::from_config(&config).interval(),
            Duration::seconds(2)
        );
    }
}
