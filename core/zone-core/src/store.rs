//! Record store seams.
//!
//! Zones coordinate only through two kinds of rows: the leader's liveness
//! stamp and each character's last known region. The orchestration code talks
//! to them through these traits so it never depends on the backing database.
//!
//! The location row has one writer at a time only by convention: the zone
//! hosting a character destroys its copy right after redirecting it. Nothing
//! locks the row, and a zone crashing mid-handoff can leave it pointing at a
//! region the character never reached. Readers only use it to decide where to
//! redirect, and the redirected client still has to connect normally.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use zoneweave_protocol::Position;

use crate::error::Result;

const BARE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// What the store holds for a zone's liveness row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneOnline {
    Missing,
    /// The row exists but carries the empty "offline" marker.
    Offline,
    Malformed(String),
    Online(DateTime<Utc>),
}

impl ZoneOnline {
    pub fn from_stored(value: &str) -> Self {
        if value.trim().is_empty() {
            return ZoneOnline::Offline;
        }
        match parse_online_timestamp(value) {
            Some(at) => ZoneOnline::Online(at),
            None => ZoneOnline::Malformed(value.to_string()),
        }
    }

    /// Time since the last stamp. `None` means unbounded: no usable stamp.
    pub fn elapsed_since(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            ZoneOnline::Online(at) => Some(now.signed_duration_since(*at).max(Duration::zero())),
            ZoneOnline::Missing | ZoneOnline::Offline | ZoneOnline::Malformed(_) => None,
        }
    }
}

pub trait LivenessStore {
    /// Stamps `zone` as online at `at`. Only the leader calls this.
    fn save_zone_online_time(&self, zone: &str, at: DateTime<Utc>) -> Result<()>;

    fn zone_online_time(&self, zone: &str) -> Result<ZoneOnline>;

    fn time_elapsed_since_zone_online(
        &self,
        zone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        Ok(self.zone_online_time(zone)?.elapsed_since(now))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterSnapshot {
    pub character_name: String,
    pub position: Position,
}

pub trait CharacterPersistence {
    fn get_last_known_region(&self, character_name: &str) -> Result<Option<String>>;

    fn record_region(&self, character_name: &str, region_path: &str) -> Result<()>;

    fn save_character_snapshot(&self, snapshot: &CharacterSnapshot) -> Result<()>;
}

/// Accepts RFC 3339 and the bare `YYYY-MM-DDTHH:MM:SS` form (read as UTC).
pub fn parse_online_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, BARE_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn format_online_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
