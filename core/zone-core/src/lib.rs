//! # zoneweave-core
//!
//! Orchestration for a world split across zone processes, one region each.
//!
//! A leader process (started without `-scenePath`) spawns one sibling per
//! other configured region and stamps a liveness row in the shared record
//! store. Siblings watch that stamp and exit once it goes stale. Every zone
//! runs the handoff engine, which redirects players to the zone their
//! character belongs in and destroys the local copy in the same step.
//!
//! ## Module map
//!
//! - [`identity`]: launch arguments, region selector, port assignment
//! - [`supervisor`]: sibling spawning (leader only)
//! - [`liveness`]: heartbeat writer and watchdog
//! - [`handoff`]: redirect policy, server-side engine, client-side follower
//! - [`bootstrap`]: network-ready wait and reconnect gating
//! - [`zone`]: the per-process context tying those together
//! - [`store`] / [`db`]: record store seams and their SQLite implementation
//!
//! Nothing in this crate blocks or spawns threads. The host drives time
//! through [`zone::ZoneContext::tick`].

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod handoff;
pub mod host;
pub mod identity;
pub mod liveness;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod zone;

pub use config::{load_config, resolve_config_path, ZoneConfig};
pub use db::Db;
pub use error::{Result, ZoneError};
pub use handoff::{HandoffClient, HandoffEngine, RedirectPolicy};
pub use identity::{LaunchArgs, PortMap, ZoneRuntimeIdentity};
pub use zone::{Termination, ZoneContext};
