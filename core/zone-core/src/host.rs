//! Seams to the world host: the transport and region loading that the
//! orchestration drives but does not implement.

use zoneweave_protocol::RedirectMessage;

use crate::error::Result;

pub type ConnectionId = u64;

/// A character in the world, as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerHandle {
    pub connection: ConnectionId,
    pub character_name: String,
    /// The host's own locally played character in host mode. Redirecting it
    /// would shut the server down, so handoff refuses to.
    pub is_local: bool,
}

impl PlayerHandle {
    pub fn remote(connection: ConnectionId, character_name: impl Into<String>) -> Self {
        Self {
            connection,
            character_name: character_name.into(),
            is_local: false,
        }
    }

    pub fn local(connection: ConnectionId, character_name: impl Into<String>) -> Self {
        Self {
            connection,
            character_name: character_name.into(),
            is_local: true,
        }
    }
}

/// Server half of the world host.
pub trait RegionServer {
    /// Port the next `start_server` binds.
    fn set_port(&mut self, port: u16);

    fn start_server(&mut self) -> Result<()>;

    /// Whether the network stack is up. Region changes are only valid after
    /// this reports true.
    fn is_network_active(&self) -> bool;

    fn is_server_active(&self) -> bool;

    /// Loads `region_name` as the served region. Completion is reported back
    /// through the region-loaded notification.
    fn change_server_region(&mut self, region_name: &str) -> Result<()>;

    fn send_redirect(&mut self, connection: ConnectionId, message: &RedirectMessage) -> Result<()>;

    /// Removes the connection's in-world character from this zone.
    fn destroy_player(&mut self, connection: ConnectionId);
}

/// Client half of the world host.
pub trait RegionClient {
    fn is_server_active(&self) -> bool;

    fn set_port(&mut self, port: u16);

    fn start_client(&mut self) -> Result<()>;

    fn stop_client(&mut self);

    /// Full transport reset. A stopped client that is not reinitialized keeps
    /// stale spawned objects around and duplicates them on the next connect.
    fn shutdown_and_reinitialize(&mut self);

    /// Starts loading `region_name`. Completion is reported back through the
    /// region-loaded notification.
    fn load_region(&mut self, region_name: &str) -> Result<()>;
}
