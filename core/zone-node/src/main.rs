//! zone-node: one zone of a zoneweave world.
//!
//! Started without `-scenePath` it is the leader: it serves the home region,
//! spawns a sibling per other configured region and writes the liveness
//! heartbeat. Started with `-scenePath <region>` it serves that region and
//! exits as soon as the leader's heartbeat goes stale.
//!
//! Every other argument is opaque and forwarded to siblings untouched.

mod host;
mod logging;
mod node;
mod portals;

use std::sync::mpsc;
use tracing::{error, info, warn};

use zoneweave_core::config::{load_config, resolve_config_path};
use zoneweave_core::identity::region_name;
use zoneweave_core::{Db, LaunchArgs, ZoneContext, ZoneError};

use host::{TcpRegionServer, EVENT_QUEUE_DEPTH};
use node::ZoneNode;

fn main() {
    let launch = LaunchArgs::from_env();
    let config = resolve_config_path(&launch).and_then(|path| load_config(&path));

    let zone_name = region_name(launch.region_selector().unwrap_or_else(|| match &config {
        Ok(config) => config.home_region(),
        Err(_) => "",
    }));
    let log_dir = config.as_ref().ok().and_then(|config| config.log_dir().ok());
    let _logging_guard = logging::init(log_dir.as_deref(), &zone_name);

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load zone configuration");
            std::process::exit(1);
        }
    };

    let db = match config.database_path().and_then(Db::new) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to open record store");
            std::process::exit(1);
        }
    };

    let bind_address = config.bind_address.clone();
    let zone = match ZoneContext::claim(config, launch) {
        Ok(zone) => zone,
        Err(ZoneError::DuplicateZone) => {
            warn!("Zone context already active in this process; not starting another");
            return;
        }
        Err(err) => {
            error!(error = %err, "Failed to resolve zone identity");
            std::process::exit(1);
        }
    };

    let (events_tx, events_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
    let server = TcpRegionServer::new(
        bind_address,
        zone.identity().region_path(),
        zone.identity().is_leader(),
        events_tx,
    );

    match ZoneNode::new(zone, server, events_rx, db).run() {
        Ok(Some(termination)) => {
            info!(
                leader = %termination.leader_zone_id,
                "Leader lost; zone exiting"
            );
        }
        Ok(None) => {
            info!("Zone host loop stopped");
        }
        Err(err) => {
            error!(error = %err, "Zone failed");
            std::process::exit(1);
        }
    }
}
