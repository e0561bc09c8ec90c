//! Moving a player's session from one zone to another.
//!
//! Server side, [`HandoffEngine`] decides when a player must leave this zone:
//! reactively when a joining character is recorded as living elsewhere, or
//! proactively when the world reports a boundary crossing. Either way the
//! client gets a redirect and the local copy of the character is destroyed in
//! the same step, so it never coexists with the copy in the target zone.
//!
//! Client side, [`HandoffClient`] follows redirects: full transport teardown,
//! load the target region, and only then reconnect to the target's port.

use std::collections::HashMap;
use tracing::{debug, info, warn};
use zoneweave_protocol::{Position, RedirectMessage};

use crate::bootstrap::{HandoffIntent, ReconnectGate};
use crate::config::ZoneConfig;
use crate::error::{Result, ZoneError};
use crate::host::{ConnectionId, PlayerHandle, RegionClient, RegionServer};
use crate::identity::{region_name, PortMap};
use crate::store::{CharacterPersistence, CharacterSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Redirect policy
// ─────────────────────────────────────────────────────────────────────────────

/// Checks applied to redirects before they are sent and again before a client
/// follows one.
#[derive(Debug, Clone, Default)]
pub struct RedirectPolicy {
    /// `None` accepts any target.
    known_regions: Option<Vec<String>>,
    shared_secret: Option<String>,
}

impl RedirectPolicy {
    pub fn from_config(config: &ZoneConfig) -> Self {
        let known_regions = config.redirect.validate_target.then(|| {
            config
                .regions
                .iter()
                .filter(|path| !path.trim().is_empty())
                .cloned()
                .collect()
        });
        Self {
            known_regions,
            shared_secret: config
                .redirect
                .shared_secret
                .clone()
                .filter(|secret| !secret.is_empty()),
        }
    }

    /// Accepts every well-formed redirect.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Builds the redirect for `character_name`, signed when a secret is set.
    pub fn issue(&self, target_region_path: &str, character_name: &str) -> Result<RedirectMessage> {
        self.check_target(target_region_path)?;
        let mut message = RedirectMessage::new(target_region_path, character_name);
        message
            .validate()
            .map_err(|err| ZoneError::RedirectRejected(err.to_string()))?;
        if let Some(secret) = &self.shared_secret {
            message.token = Some(redirect_token(secret, target_region_path, character_name));
        }
        Ok(message)
    }

    /// Validates a received redirect. `expected_character` is the character
    /// this client is playing, when it knows it.
    pub fn verify(&self, message: &RedirectMessage, expected_character: Option<&str>) -> Result<()> {
        message
            .validate()
            .map_err(|err| ZoneError::RedirectRejected(err.to_string()))?;
        self.check_target(&message.scene_path)?;

        if let Some(expected) = expected_character {
            if message.character_name != expected {
                return Err(ZoneError::RedirectRejected(format!(
                    "redirect names {} but this client plays {}",
                    message.character_name, expected
                )));
            }
        }

        if let Some(secret) = &self.shared_secret {
            let expected = redirect_token(secret, &message.scene_path, &message.character_name);
            if message.token.as_deref() != Some(expected.as_str()) {
                return Err(ZoneError::RedirectRejected(
                    "redirect token missing or invalid".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn check_target(&self, target_region_path: &str) -> Result<()> {
        if target_region_path.trim().is_empty() {
            return Err(ZoneError::RedirectRejected(
                "redirect target is empty".to_string(),
            ));
        }
        match &self.known_regions {
            Some(known) if !known.iter().any(|path| path == target_region_path) => Err(
                ZoneError::RedirectRejected(format!("unknown target region {}", target_region_path)),
            ),
            _ => Ok(()),
        }
    }
}

pub fn redirect_token(secret: &str, scene_path: &str, character_name: &str) -> String {
    let digest = md5::compute(format!("{}\n{}\n{}", secret, scene_path, character_name));
    format!("{:x}", digest)
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The character lives in this zone.
    Local,
    /// The client was told to move to `target`; its character is gone here.
    RedirectSent { target: String },
}

/// Reported by the world when an entity enters a boundary trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCrossing {
    pub player: PlayerHandle,
    pub boundary: String,
    pub destination: String,
    /// Where the character should appear in the destination region.
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Local,
    Redirected { target: String },
    /// The character is recorded elsewhere but the redirect was refused, so
    /// it stays here.
    KeptLocal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossingOutcome {
    Redirected { target: String },
    RefusedHost,
    NotServer,
    AlreadyLeaving,
    Rejected(String),
}

#[derive(Debug)]
pub struct HandoffEngine {
    region_path: String,
    policy: RedirectPolicy,
    sessions: HashMap<ConnectionId, SessionState>,
}

impl HandoffEngine {
    pub fn new(region_path: impl Into<String>, policy: RedirectPolicy) -> Self {
        Self {
            region_path: region_path.into(),
            policy,
            sessions: HashMap::new(),
        }
    }

    pub fn region_path(&self) -> &str {
        &self.region_path
    }

    pub fn session(&self, connection: ConnectionId) -> Option<&SessionState> {
        self.sessions.get(&connection)
    }

    /// Reactive path, run when a player has just been added to this zone.
    ///
    /// A store read failure is returned to the caller, which decides whether
    /// to keep the player; nothing is redirected in that case.
    pub fn on_player_added(
        &mut self,
        server: &mut dyn RegionServer,
        store: &dyn CharacterPersistence,
        player: &PlayerHandle,
    ) -> Result<AdmitOutcome> {
        let recorded = store.get_last_known_region(&player.character_name)?;
        let target = match recorded {
            Some(target) if target != self.region_path => target,
            _ => {
                self.sessions.insert(player.connection, SessionState::Local);
                return Ok(AdmitOutcome::Local);
            }
        };

        if player.is_local {
            warn!(
                character = %player.character_name,
                recorded = %target,
                "Host player is recorded in another region; keeping it here"
            );
            self.sessions.insert(player.connection, SessionState::Local);
            return Ok(AdmitOutcome::KeptLocal {
                reason: "host player".to_string(),
            });
        }

        let message = match self.policy.issue(&target, &player.character_name) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    character = %player.character_name,
                    recorded = %target,
                    error = %err,
                    "Refusing reactive redirect"
                );
                self.sessions.insert(player.connection, SessionState::Local);
                return Ok(AdmitOutcome::KeptLocal {
                    reason: err.to_string(),
                });
            }
        };

        info!(
            character = %player.character_name,
            target = %target,
            "Character lives in another zone; redirecting"
        );
        self.redirect(server, player.connection, &message);
        Ok(AdmitOutcome::Redirected { target })
    }

    /// Proactive path, run when a player crosses into another region.
    ///
    /// The arrival position and location record are persisted before the
    /// redirect goes out. If either write fails the error is returned and the
    /// player stays where it is.
    pub fn on_boundary_crossed(
        &mut self,
        server: &mut dyn RegionServer,
        store: &dyn CharacterPersistence,
        crossing: &BoundaryCrossing,
    ) -> Result<CrossingOutcome> {
        let player = &crossing.player;
        if !server.is_server_active() {
            return Ok(CrossingOutcome::NotServer);
        }
        if player.is_local {
            warn!(
                character = %player.character_name,
                boundary = %crossing.boundary,
                "Refusing to hand off the host's own player; it would stop this server"
            );
            return Ok(CrossingOutcome::RefusedHost);
        }
        if let Some(SessionState::RedirectSent { .. }) = self.sessions.get(&player.connection) {
            debug!(character = %player.character_name, "Crossing ignored; already leaving");
            return Ok(CrossingOutcome::AlreadyLeaving);
        }
        if crossing.destination == self.region_path {
            return Ok(CrossingOutcome::Rejected(
                "destination is this zone".to_string(),
            ));
        }

        let message = match self.policy.issue(&crossing.destination, &player.character_name) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    character = %player.character_name,
                    boundary = %crossing.boundary,
                    error = %err,
                    "Refusing boundary handoff"
                );
                return Ok(CrossingOutcome::Rejected(err.to_string()));
            }
        };

        store.save_character_snapshot(&CharacterSnapshot {
            character_name: player.character_name.clone(),
            position: crossing.position,
        })?;
        store.record_region(&player.character_name, &crossing.destination)?;

        info!(
            character = %player.character_name,
            boundary = %crossing.boundary,
            target = %crossing.destination,
            "Boundary crossed; handing off"
        );
        self.redirect(server, player.connection, &message);
        Ok(CrossingOutcome::Redirected {
            target: crossing.destination.clone(),
        })
    }

    pub fn on_connection_closed(&mut self, connection: ConnectionId) -> Option<SessionState> {
        self.sessions.remove(&connection)
    }

    fn redirect(&mut self, server: &mut dyn RegionServer, connection: ConnectionId, message: &RedirectMessage) {
        if let Err(err) = server.send_redirect(connection, message) {
            warn!(connection, error = %err, "Failed to send redirect");
        }
        server.destroy_player(connection);
        self.sessions.insert(
            connection,
            SessionState::RedirectSent {
                target: message.scene_path.clone(),
            },
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Connecting,
    Connected,
    /// Torn down after a redirect; waiting for the target region to load.
    AwaitingReconnect,
}

#[derive(Debug)]
pub struct HandoffClient {
    ports: PortMap,
    policy: RedirectPolicy,
    character_name: String,
    gate: ReconnectGate,
    phase: ClientPhase,
}

impl HandoffClient {
    pub fn new(ports: PortMap, policy: RedirectPolicy, character_name: impl Into<String>) -> Self {
        Self {
            ports,
            policy,
            character_name: character_name.into(),
            gate: ReconnectGate::default(),
            phase: ClientPhase::Idle,
        }
    }

    pub fn from_config(config: &ZoneConfig, character_name: impl Into<String>) -> Self {
        Self::new(
            PortMap::from_config(config),
            RedirectPolicy::from_config(config),
            character_name,
        )
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// The character to join as.
    pub fn character_name(&self) -> &str {
        &self.character_name
    }

    pub fn pending_intent(&self) -> Option<&HandoffIntent> {
        self.gate.intent()
    }

    /// First connection, to the zone serving `region_path`.
    pub fn connect(&mut self, client: &mut dyn RegionClient, region_path: &str) -> Result<u16> {
        let port = self.ports.port_for_path(region_path)?;
        client.set_port(port);
        client.start_client()?;
        self.phase = ClientPhase::Connecting;
        Ok(port)
    }

    /// Starts following `message`. Returns `false` when the redirect is not
    /// for this process (it is hosting a server).
    pub fn on_redirect(&mut self, client: &mut dyn RegionClient, message: &RedirectMessage) -> Result<bool> {
        if client.is_server_active() {
            debug!(target = %message.scene_path, "Ignoring redirect while hosting");
            return Ok(false);
        }
        self.policy.verify(message, Some(&self.character_name))?;

        info!(
            target = %message.scene_path,
            character = %message.character_name,
            "Following redirect"
        );
        client.stop_client();
        client.shutdown_and_reinitialize();

        self.gate.arm(HandoffIntent {
            target_region_path: message.scene_path.clone(),
            target_character_name: message.character_name.clone(),
            awaiting_auto_connect: true,
        });
        self.phase = ClientPhase::AwaitingReconnect;

        client.load_region(&region_name(&message.scene_path))?;
        Ok(true)
    }

    /// Reconnects once the region the latest redirect asked for has loaded.
    /// Returns the port connected to, if a reconnect was started.
    pub fn on_region_loaded(
        &mut self,
        client: &mut dyn RegionClient,
        loaded_region_name: &str,
    ) -> Result<Option<u16>> {
        let Some(intent) = self.gate.on_region_loaded(loaded_region_name) else {
            return Ok(None);
        };
        let port = match self.ports.port_for_path(&intent.target_region_path) {
            Ok(port) => port,
            Err(err) => {
                self.phase = ClientPhase::Idle;
                return Err(err);
            }
        };
        info!(
            region = %loaded_region_name,
            port,
            "Target region loaded; reconnecting"
        );
        client.set_port(port);
        self.phase = ClientPhase::Connecting;
        client.start_client()?;
        Ok(Some(port))
    }

    pub fn on_connected(&mut self) {
        self.phase = ClientPhase::Connected;
        self.gate.clear();
    }

    /// The teardown done while following a redirect also reports a
    /// disconnect; that one leaves the pending intent alone.
    pub fn on_disconnected(&mut self) {
        if self.phase == ClientPhase::AwaitingReconnect {
            return;
        }
        self.phase = ClientPhase::Idle;
        self.gate.clear();
    }
}
