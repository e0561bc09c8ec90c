//! TCP world host for one zone.
//!
//! Sockets are read on background threads, but every decision happens on the
//! host loop: readers only turn frames into [`HostEvent`]s and push them down
//! a bounded channel. Writes to clients happen on the loop, through the
//! stream handle registered when the connection was accepted. Every accepted
//! stream carries a write timeout, and a peer that stops reading is dropped
//! rather than allowed to stall the loop.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use zoneweave_core::host::{ConnectionId, RegionServer};
use zoneweave_core::identity::region_name;
use zoneweave_core::{Result, ZoneError};
use zoneweave_protocol::{
    encode_line, parse_client_message, read_frame, ClientMessage, ErrorInfo, Position,
    RedirectMessage, ServerMessage,
};

/// Events readers may queue before they wait for the host loop.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

/// Longest the host loop waits on a single client write.
const WRITE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum HostEvent {
    Connected {
        connection: ConnectionId,
        stream: TcpStream,
    },
    Message {
        connection: ConnectionId,
        message: ClientMessage,
    },
    Invalid {
        connection: ConnectionId,
        error: ErrorInfo,
    },
    Closed {
        connection: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub character_name: String,
    pub position: Position,
}

pub struct TcpRegionServer {
    bind_address: String,
    port: u16,
    region_path: String,
    region_ready: bool,
    loaded_region: Option<String>,
    local_addr: Option<SocketAddr>,
    events: SyncSender<HostEvent>,
    next_connection: Arc<AtomicU64>,
    connections: HashMap<ConnectionId, TcpStream>,
    players: HashMap<ConnectionId, Player>,
}

impl TcpRegionServer {
    /// `region_ready` is true for the leader, which serves its home region
    /// from the start; siblings become ready once their region change lands.
    pub fn new(
        bind_address: impl Into<String>,
        region_path: impl Into<String>,
        region_ready: bool,
        events: SyncSender<HostEvent>,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            port: 0,
            region_path: region_path.into(),
            region_ready,
            loaded_region: None,
            local_addr: None,
            events,
            next_connection: Arc::new(AtomicU64::new(1)),
            connections: HashMap::new(),
            players: HashMap::new(),
        }
    }

    pub fn region_path(&self) -> &str {
        &self.region_path
    }

    pub fn is_region_ready(&self) -> bool {
        self.region_ready
    }

    /// Region whose load finished since the last call. Marks the server
    /// ready to admit players.
    pub fn take_loaded_region(&mut self) -> Option<String> {
        let name = self.loaded_region.take()?;
        self.region_ready = true;
        Some(name)
    }

    pub fn register_connection(&mut self, connection: ConnectionId, stream: TcpStream) {
        debug!(connection, peer = ?stream.peer_addr().ok(), "Client connected");
        self.connections.insert(connection, stream);
    }

    /// Drops the connection and whatever player it had.
    pub fn close_connection(&mut self, connection: ConnectionId) {
        self.players.remove(&connection);
        if let Some(stream) = self.connections.remove(&connection) {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(connection, "Client connection closed");
        }
    }

    pub fn add_player(&mut self, connection: ConnectionId, player: Player) {
        self.players.insert(connection, player);
    }

    pub fn player(&self, connection: ConnectionId) -> Option<&Player> {
        self.players.get(&connection)
    }

    pub fn move_player(&mut self, connection: ConnectionId, position: Position) -> Option<&Player> {
        let player = self.players.get_mut(&connection)?;
        player.position = position;
        Some(player)
    }

    pub fn send(&mut self, connection: ConnectionId, message: &ServerMessage) -> Result<()> {
        let bytes = encode_line(message).map_err(|err| ZoneError::Transport(err.to_string()))?;
        let stream = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| ZoneError::Transport(format!("connection {} is gone", connection)))?;
        if let Err(source) = stream.write_all(&bytes).and_then(|_| stream.flush()) {
            // A partial line may already be on the wire; the stream is unusable.
            warn!(connection, error = %source, "Client write failed; dropping connection");
            self.close_connection(connection);
            return Err(ZoneError::Io {
                context: format!("Failed to write to connection {}", connection),
                source,
            });
        }
        Ok(())
    }

    pub fn send_error(&mut self, connection: ConnectionId, error: ErrorInfo) {
        if let Err(err) = self.send(connection, &ServerMessage::Error(error)) {
            debug!(connection, error = %err, "Failed to send error to client");
        }
    }
}

impl RegionServer for TcpRegionServer {
    fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    fn start_server(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.bind_address.as_str(), self.port)).map_err(|source| {
            ZoneError::Io {
                context: format!("Failed to bind {}:{}", self.bind_address, self.port),
                source,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|source| ZoneError::Io {
            context: "Failed to read listener address".to_string(),
            source,
        })?;
        info!(addr = %local_addr, region = %self.region_path, "Zone server listening");

        let events = self.events.clone();
        let next_connection = Arc::clone(&self.next_connection);
        thread::spawn(move || accept_loop(listener, events, next_connection));

        self.local_addr = Some(local_addr);
        Ok(())
    }

    fn is_network_active(&self) -> bool {
        self.local_addr.is_some()
    }

    fn is_server_active(&self) -> bool {
        self.local_addr.is_some()
    }

    /// Regions have no assets to stream, so loading completes immediately.
    /// The host loop picks the notification up through
    /// [`TcpRegionServer::take_loaded_region`].
    fn change_server_region(&mut self, name: &str) -> Result<()> {
        if name != region_name(&self.region_path) {
            return Err(ZoneError::UnknownRegion(name.to_string()));
        }
        self.loaded_region = Some(name.to_string());
        Ok(())
    }

    fn send_redirect(&mut self, connection: ConnectionId, message: &RedirectMessage) -> Result<()> {
        self.send(connection, &ServerMessage::SwitchServer(message.clone()))
    }

    fn destroy_player(&mut self, connection: ConnectionId) {
        if let Some(player) = self.players.remove(&connection) {
            debug!(connection, character = %player.character_name, "Player removed from zone");
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    events: SyncSender<HostEvent>,
    next_connection: Arc<AtomicU64>,
) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "Failed to accept zone connection");
                continue;
            }
        };
        if let Err(err) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
            warn!(error = %err, "Failed to set write timeout on zone connection");
            continue;
        }
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                warn!(error = %err, "Failed to clone zone connection");
                continue;
            }
        };

        let connection = next_connection.fetch_add(1, Ordering::Relaxed);
        if events
            .send(HostEvent::Connected { connection, stream })
            .is_err()
        {
            return;
        }
        let events = events.clone();
        thread::spawn(move || read_loop(connection, reader, events));
    }
}

fn read_loop(connection: ConnectionId, stream: TcpStream, events: SyncSender<HostEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(line)) => {
                let event = match parse_client_message(&line) {
                    Ok(message) => HostEvent::Message {
                        connection,
                        message,
                    },
                    Err(error) => HostEvent::Invalid { connection, error },
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(connection, error = %err, "Zone connection read failed");
                break;
            }
        }
    }
    let _ = events.send(HostEvent::Closed { connection });
}
