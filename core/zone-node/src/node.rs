//! The zone's host loop.

use chrono::Utc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

use zoneweave_core::handoff::{AdmitOutcome, BoundaryCrossing, CrossingOutcome};
use zoneweave_core::host::{ConnectionId, PlayerHandle, RegionServer};
use zoneweave_core::supervisor::CommandSpawner;
use zoneweave_core::{Db, Termination, ZoneContext};
use zoneweave_protocol::{ClientMessage, ErrorInfo, Position, ServerMessage};

use crate::host::{HostEvent, Player, TcpRegionServer};
use crate::portals::PortalSet;

/// Longest the loop sleeps when no task is due.
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub struct ZoneNode {
    zone: ZoneContext,
    server: TcpRegionServer,
    events: Receiver<HostEvent>,
    db: Db,
    spawner: CommandSpawner,
    portals: PortalSet,
}

impl ZoneNode {
    pub fn new(
        zone: ZoneContext,
        server: TcpRegionServer,
        events: Receiver<HostEvent>,
        db: Db,
    ) -> Self {
        let portals = PortalSet::for_region(zone.config(), zone.identity().region_path());
        Self {
            zone,
            server,
            events,
            db,
            spawner: CommandSpawner::new(),
            portals,
        }
    }

    /// Brings the server up and runs until the watchdog gives up on the
    /// leader, or the event channel closes.
    pub fn run(mut self) -> zoneweave_core::Result<Option<Termination>> {
        let now = Utc::now();
        self.zone.begin_bootstrap(&mut self.server, now);
        self.server.start_server()?;

        let report = self
            .zone
            .on_server_started(&self.server, &mut self.spawner, Utc::now());
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Some sibling zones failed to spawn");
        }
        info!(
            portals = self.portals.len(),
            spawned = report.spawned.len(),
            "Zone running"
        );

        loop {
            if let Some(termination) = self.zone.tick(Utc::now(), &mut self.server, &self.db) {
                return Ok(Some(termination));
            }
            if let Some(region_name) = self.server.take_loaded_region() {
                self.zone.on_region_loaded(&region_name, Utc::now());
            }
            if !self.spawner.reap_exited().is_empty() {
                info!(running = self.spawner.running(), "Sibling zones still running");
            }

            match self.events.recv_timeout(self.wait_budget()) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn wait_budget(&self) -> Duration {
        match self.zone.next_wakeup() {
            Some(due) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(IDLE_WAIT),
            None => IDLE_WAIT,
        }
    }

    fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connected { connection, stream } => {
                self.server.register_connection(connection, stream);
            }
            HostEvent::Message {
                connection,
                message,
            } => self.handle_message(connection, message),
            HostEvent::Invalid { connection, error } => {
                warn!(connection, code = %error.code, message = %error.message, "Invalid client message");
                self.server.send_error(connection, error);
            }
            HostEvent::Closed { connection } => {
                self.zone.handoff_mut().on_connection_closed(connection);
                self.server.close_connection(connection);
            }
        }
    }

    fn handle_message(&mut self, connection: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Join { character_name, .. } => self.join(connection, character_name),
            ClientMessage::Move { position } => self.move_player(connection, position),
            ClientMessage::Leave => {
                self.zone.handoff_mut().on_connection_closed(connection);
                self.server.close_connection(connection);
            }
        }
    }

    fn join(&mut self, connection: ConnectionId, character_name: String) {
        if !self.server.is_region_ready() {
            self.server.send_error(
                connection,
                ErrorInfo::new("region_loading", "zone region is still loading"),
            );
            return;
        }
        if self.server.player(connection).is_some() {
            self.server.send_error(
                connection,
                ErrorInfo::new("already_joined", "connection already has a character"),
            );
            return;
        }

        let saved = match self.db.get_character_position(&character_name) {
            Ok(saved) => saved.map(|row| row.position),
            Err(err) => {
                warn!(character = %character_name, error = %err, "Failed to load saved position");
                None
            }
        };
        self.server.add_player(
            connection,
            Player {
                character_name: character_name.clone(),
                position: saved.unwrap_or_default(),
            },
        );

        let handle = PlayerHandle::remote(connection, character_name.clone());
        let outcome = self
            .zone
            .handoff_mut()
            .on_player_added(&mut self.server, &self.db, &handle);
        match outcome {
            Ok(AdmitOutcome::Redirected { .. }) => return,
            Ok(AdmitOutcome::Local) | Ok(AdmitOutcome::KeptLocal { .. }) => {}
            Err(err) => {
                warn!(
                    character = %character_name,
                    error = %err,
                    "Location lookup failed; admitting player here"
                );
            }
        }

        info!(connection, character = %character_name, "Player joined zone");
        let welcome = ServerMessage::Welcome {
            region_path: self.server.region_path().to_string(),
            position: saved,
        };
        if let Err(err) = self.server.send(connection, &welcome) {
            warn!(connection, error = %err, "Failed to welcome player");
        }
    }

    fn move_player(&mut self, connection: ConnectionId, position: Position) {
        let Some(player) = self.server.move_player(connection, position) else {
            self.server.send_error(
                connection,
                ErrorInfo::new("not_joined", "join before moving"),
            );
            return;
        };
        let character_name = player.character_name.clone();

        let Some(portal) = self.portals.triggered_by(position) else {
            return;
        };
        debug!(character = %character_name, portal = %portal.name, "Portal entered");

        let crossing = BoundaryCrossing {
            player: PlayerHandle::remote(connection, character_name.clone()),
            boundary: portal.name.clone(),
            destination: portal.destination.clone(),
            position: portal.arrival,
        };
        match self
            .zone
            .handoff_mut()
            .on_boundary_crossed(&mut self.server, &self.db, &crossing)
        {
            Ok(CrossingOutcome::Redirected { .. }) => {}
            Ok(other) => debug!(character = %character_name, outcome = ?other, "Crossing not handed off"),
            Err(err) => warn!(
                character = %character_name,
                error = %err,
                "Failed to persist handoff; player stays"
            ),
        }
    }
}
