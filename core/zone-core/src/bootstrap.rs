//! Session bootstrap: ordering guarantees around region loads.
//!
//! Server side, a sibling must not ask for its region until its network stack
//! is up; [`ServerBootstrap`] holds the request back until then. Client side,
//! a redirected client must not reconnect until the target region has
//! finished loading; [`ReconnectGate`] holds the reconnect back until the
//! matching region-loaded notification arrives.

use tracing::{debug, info};

use crate::error::Result;
use crate::host::RegionServer;
use crate::identity::{region_name, ZoneRuntimeIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Leader, or not started yet.
    Idle,
    AwaitingNetwork,
    RegionRequested,
}

#[derive(Debug, Clone)]
pub struct ServerBootstrap {
    selected_region_path: Option<String>,
    port: u16,
    phase: BootstrapPhase,
}

impl ServerBootstrap {
    pub fn new(identity: &ZoneRuntimeIdentity) -> Self {
        Self {
            selected_region_path: identity.selected_region_path().map(str::to_string),
            port: identity.assigned_port(),
            phase: BootstrapPhase::Idle,
        }
    }

    /// Points the transport at this zone's port. For a sibling, also arms the
    /// wait for the network; returns whether the caller should start polling.
    pub fn start(&mut self, server: &mut dyn RegionServer) -> bool {
        server.set_port(self.port);
        match &self.selected_region_path {
            Some(path) => {
                info!(
                    port = self.port,
                    region = %region_name(path),
                    "Setting zone port"
                );
                self.phase = BootstrapPhase::AwaitingNetwork;
                true
            }
            None => false,
        }
    }

    /// One polling step. Requests the region change once the network is up.
    pub fn poll(&mut self, server: &mut dyn RegionServer) -> Result<BootstrapPhase> {
        if self.phase != BootstrapPhase::AwaitingNetwork {
            return Ok(self.phase);
        }
        if !server.is_network_active() {
            debug!("Waiting for network to become active");
            return Ok(self.phase);
        }

        let name = self
            .selected_region_path
            .as_deref()
            .map(region_name)
            .unwrap_or_default();
        info!(region = %name, "Switching zone server region");
        self.phase = BootstrapPhase::RegionRequested;
        server.change_server_region(&name)?;
        Ok(self.phase)
    }
}

/// Pending handoff reconnect for one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffIntent {
    pub target_region_path: String,
    pub target_character_name: String,
    pub awaiting_auto_connect: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectGate {
    intent: Option<HandoffIntent>,
}

impl ReconnectGate {
    /// Arms the gate for `intent`, replacing whatever was pending.
    pub fn arm(&mut self, intent: HandoffIntent) {
        self.intent = Some(intent);
    }

    pub fn intent(&self) -> Option<&HandoffIntent> {
        self.intent.as_ref()
    }

    pub fn is_awaiting(&self) -> bool {
        self.intent
            .as_ref()
            .map(|intent| intent.awaiting_auto_connect)
            .unwrap_or(false)
    }

    /// Opens the gate if `loaded_region_name` is the region the pending
    /// intent is waiting for. Opens at most once per armed intent.
    pub fn on_region_loaded(&mut self, loaded_region_name: &str) -> Option<HandoffIntent> {
        let intent = self.intent.as_mut()?;
        if !intent.awaiting_auto_connect {
            return None;
        }
        if region_name(&intent.target_region_path) != loaded_region_name {
            debug!(
                loaded = %loaded_region_name,
                awaiting = %intent.target_region_path,
                "Ignoring load of a region the handoff is not waiting for"
            );
            return None;
        }
        intent.awaiting_auto_connect = false;
        Some(intent.clone())
    }

    pub fn clear(&mut self) {
        self.intent = None;
    }
}
