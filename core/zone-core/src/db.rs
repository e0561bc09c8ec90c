//! SQLite record store shared by every zone process of a world.
//!
//! Each operation opens its own short-lived connection, so sibling processes
//! never hold the file locked between calls. Writes are upserts on the
//! primary key; the store gives no ordering beyond serializing individual
//! statements.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use zoneweave_protocol::Position;

use crate::error::{Result, ZoneError};
use crate::store::{
    format_online_timestamp, CharacterPersistence, CharacterSnapshot, LivenessStore, ZoneOnline,
};

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ZoneInfoRow {
    pub zone_name: String,
    pub online: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CharacterPositionRow {
    pub character: String,
    pub position: Position,
    pub saved_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list_zones(&self) -> Result<Vec<ZoneInfoRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT zone_name, online FROM zone_info ORDER BY zone_name ASC")
                .map_err(|err| ZoneError::store("Failed to prepare zone_info query", err))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(ZoneInfoRow {
                        zone_name: row.get(0)?,
                        online: row.get(1)?,
                    })
                })
                .map_err(|err| ZoneError::store("Failed to query zone_info", err))?;

            let mut zones = Vec::new();
            for row in rows {
                zones.push(row.map_err(|err| ZoneError::store("Failed to decode zone row", err))?);
            }
            Ok(zones)
        })
    }

    pub fn get_character_position(&self, character: &str) -> Result<Option<CharacterPositionRow>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT character, x, y, z, saved_at FROM character_positions WHERE character = ?1",
                params![character],
                |row| {
                    Ok(CharacterPositionRow {
                        character: row.get(0)?,
                        position: Position::new(
                            row.get::<_, f64>(1)? as f32,
                            row.get::<_, f64>(2)? as f32,
                            row.get::<_, f64>(3)? as f32,
                        ),
                        saved_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|err| ZoneError::store("Failed to query character position", err))
        })
    }

    fn upsert_zone_online(&self, zone: &str, online: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO zone_info (zone_name, online) VALUES (?1, ?2) \
                 ON CONFLICT(zone_name) DO UPDATE SET online = excluded.online",
                params![zone, online],
            )
            .map_err(|err| ZoneError::store("Failed to upsert zone_info", err))?;
            Ok(())
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS zone_info (
                    zone_name TEXT PRIMARY KEY,
                    online TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS scene_info (
                    character TEXT PRIMARY KEY,
                    scene_path TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS character_positions (
                    character TEXT PRIMARY KEY,
                    x REAL NOT NULL,
                    y REAL NOT NULL,
                    z REAL NOT NULL,
                    saved_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| ZoneError::store("Failed to initialize schema", err))
        })
    }

    pub(crate) fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent).map_err(|source| ZoneError::Io {
                    context: "Failed to create data dir".to_string(),
                    source,
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| ZoneError::store("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| ZoneError::store("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| ZoneError::store("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| ZoneError::store("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

impl LivenessStore for Db {
    fn save_zone_online_time(&self, zone: &str, at: DateTime<Utc>) -> Result<()> {
        self.upsert_zone_online(zone, &format_online_timestamp(at))
    }

    fn zone_online_time(&self, zone: &str) -> Result<ZoneOnline> {
        let online: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT online FROM zone_info WHERE zone_name = ?1",
                params![zone],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| ZoneError::store("Failed to query zone_info", err))
        })?;

        Ok(match online {
            Some(value) => ZoneOnline::from_stored(&value),
            None => ZoneOnline::Missing,
        })
    }
}

impl CharacterPersistence for Db {
    fn get_last_known_region(&self, character_name: &str) -> Result<Option<String>> {
        let scene_path: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT scene_path FROM scene_info WHERE character = ?1",
                params![character_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| ZoneError::store("Failed to query scene_info", err))
        })?;
        Ok(scene_path.filter(|path| !path.trim().is_empty()))
    }

    fn record_region(&self, character_name: &str, region_path: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO scene_info (character, scene_path) VALUES (?1, ?2) \
                 ON CONFLICT(character) DO UPDATE SET scene_path = excluded.scene_path",
                params![character_name, region_path],
            )
            .map_err(|err| ZoneError::store("Failed to upsert scene_info", err))?;
            Ok(())
        })
    }

    fn save_character_snapshot(&self, snapshot: &CharacterSnapshot) -> Result<()> {
        let saved_at = format_online_timestamp(Utc::now());
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO character_positions (character, x, y, z, saved_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(character) DO UPDATE SET \
                    x = excluded.x, \
                    y = excluded.y, \
                    z = excluded.z, \
                    saved_at = excluded.saved_at",
                params![
                    snapshot.character_name,
                    f64::from(snapshot.position.x),
                    f64::from(snapshot.position.y),
                    f64::from(snapshot.position.z),
                    saved_at
                ],
            )
            .map_err(|err| ZoneError::store("Failed to upsert character position", err))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn temp_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("zones.db")).expect("db init");
        (temp_dir, db)
    }

    #[test]
    fn schema_includes_zone_and_scene_tables() {
        let (_temp_dir, db) = temp_db();
        let tables = db
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
                    .map_err(|err| ZoneError::store("sqlite_master", err))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|err| ZoneError::store("sqlite_master rows", err))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row.map_err(|err| ZoneError::store("table name", err))?);
                }
                Ok(names)
            })
            .expect("tables");

        assert!(tables.contains(&"zone_info".to_string()));
        assert!(tables.contains(&"scene_info".to_string()));
        assert!(tables.contains(&"character_positions".to_string()));
    }

    #[test]
    fn missing_zone_reads_as_unbounded() {
        let (_temp_dir, db) = temp_db();
        assert_eq!(
            db.zone_online_time("World1").expect("query"),
            ZoneOnline::Missing
        );
        assert_eq!(
            db.time_elapsed_since_zone_online("World1", Utc::now())
                .expect("query"),
            None
        );
    }

    #[test]
    fn empty_online_marker_reads_as_offline() {
        let (_temp_dir, db) = temp_db();
        db.upsert_zone_online("World1", "").expect("upsert");
        assert_eq!(
            db.zone_online_time("World1").expect("query"),
            ZoneOnline::Offline
        );
    }

    #[test]
    fn reads_bare_timestamps_written_by_other_tools() {
        let (_temp_dir, db) = temp_db();
        db.upsert_zone_online("World1", "2024-01-01T00:00:00")
            .expect("upsert");
        let elapsed = db
            .time_elapsed_since_zone_online("World1", at("2024-01-01T00:00:00.500Z"))
            .expect("query");
        assert_eq!(elapsed, Some(Duration::milliseconds(500)));
    }

    #[test]
    fn staleness_grows_between_writes_and_resets_after_one() {
        let (_temp_dir, db) = temp_db();
        let first = at("2024-01-01T00:00:00Z");
        db.save_zone_online_time("World1", first).expect("write");

        let mut previous = Duration::zero();
        for step in 1..=5 {
            let now = first + Duration::milliseconds(step * 400);
            let elapsed = db
                .time_elapsed_since_zone_online("World1", now)
                .expect("query")
                .expect("online");
            assert!(elapsed >= previous);
            previous = elapsed;
        }

        let second = first + Duration::seconds(2);
        db.save_zone_online_time("World1", second).expect("write");
        let elapsed = db
            .time_elapsed_since_zone_online("World1", second + Duration::milliseconds(10))
            .expect("query")
            .expect("online");
        assert!(elapsed < previous);
        assert_eq!(elapsed, Duration::milliseconds(10));
    }

    #[test]
    fn one_liveness_row_per_zone() {
        let (_temp_dir, db) = temp_db();
        db.save_zone_online_time("World1", at("2024-01-01T00:00:00Z"))
            .expect("write");
        db.save_zone_online_time("World1", at("2024-01-01T00:00:01Z"))
            .expect("write");
        let zones = db.list_zones().expect("list");
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].online, "2024-01-01T00:00:01.000Z");
    }

    #[test]
    fn character_region_last_write_wins() {
        let (_temp_dir, db) = temp_db();
        assert_eq!(db.get_last_known_region("Alice").expect("query"), None);

        db.record_region("Alice", "Scenes/World1.unity")
            .expect("record");
        db.record_region("Alice", "Scenes/World2.unity")
            .expect("record");
        assert_eq!(
            db.get_last_known_region("Alice").expect("query").as_deref(),
            Some("Scenes/World2.unity")
        );
    }

    #[test]
    fn empty_region_reads_as_unknown() {
        let (_temp_dir, db) = temp_db();
        db.record_region("Alice", "").expect("record");
        assert_eq!(db.get_last_known_region("Alice").expect("query"), None);
    }

    #[test]
    fn saves_character_snapshots() {
        let (_temp_dir, db) = temp_db();
        db.save_character_snapshot(&CharacterSnapshot {
            character_name: "Bob".to_string(),
            position: Position::new(5.0, 0.0, 5.0),
        })
        .expect("save");

        let row = db
            .get_character_position("Bob")
            .expect("query")
            .expect("row");
        assert_eq!(row.position, Position::new(5.0, 0.0, 5.0));
        assert!(db.get_character_position("Alice").expect("query").is_none());
    }
}
