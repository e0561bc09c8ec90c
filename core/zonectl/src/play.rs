//! Headless game client: joins a zone and follows redirects the way a real
//! client does.

use std::collections::VecDeque;
use std::io::{BufReader, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, warn};

use zoneweave_core::handoff::ClientPhase;
use zoneweave_core::host::RegionClient;
use zoneweave_core::{HandoffClient, ZoneConfig, ZoneError};
use zoneweave_protocol::{
    encode_line, parse_server_message, read_frame, ClientMessage, Position, ServerMessage,
};

use crate::CtlError;

pub enum Incoming {
    Message(ServerMessage),
    /// Nothing arrived within the read timeout.
    Idle,
    Closed,
}

pub struct TcpRegionClient {
    host: String,
    port: Option<u16>,
    read_timeout: Duration,
    stream: Option<TcpStream>,
    reader: Option<BufReader<TcpStream>>,
    loaded: VecDeque<String>,
}

impl TcpRegionClient {
    pub fn new(host: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port: None,
            read_timeout,
            stream: None,
            reader: None,
            loaded: VecDeque::new(),
        }
    }

    /// Next region whose load finished.
    pub fn take_loaded(&mut self) -> Option<String> {
        self.loaded.pop_front()
    }

    pub fn send(&mut self, message: &ClientMessage) -> Result<(), CtlError> {
        let bytes = encode_line(message).map_err(CtlError::Server)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ZoneError::Transport("not connected".to_string()))?;
        stream
            .write_all(&bytes)
            .and_then(|_| stream.flush())
            .map_err(|source| ZoneError::Io {
                context: "Failed to write to zone".to_string(),
                source,
            })?;
        Ok(())
    }

    pub fn next_message(&mut self) -> Result<Incoming, CtlError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Incoming::Closed);
        };
        match read_frame(reader) {
            Ok(Some(line)) => {
                let message = parse_server_message(&line).map_err(CtlError::Server)?;
                Ok(Incoming::Message(message))
            }
            Ok(None) => {
                self.disconnect();
                Ok(Incoming::Closed)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Incoming::Idle)
            }
            Err(err) => {
                warn!(error = %err, "Zone connection failed");
                self.disconnect();
                Ok(Incoming::Closed)
            }
        }
    }

    fn disconnect(&mut self) {
        self.reader = None;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl RegionClient for TcpRegionClient {
    fn is_server_active(&self) -> bool {
        false
    }

    fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    fn start_client(&mut self) -> zoneweave_core::Result<()> {
        let port = self
            .port
            .ok_or_else(|| ZoneError::Transport("no port set".to_string()))?;
        let stream = TcpStream::connect((self.host.as_str(), port)).map_err(|source| ZoneError::Io {
            context: format!("Failed to connect to {}:{}", self.host, port),
            source,
        })?;
        let io_err = |source| ZoneError::Io {
            context: "Failed to configure zone connection".to_string(),
            source,
        };
        stream
            .set_read_timeout(Some(self.read_timeout))
            .map_err(io_err)?;
        let reader = stream.try_clone().map_err(io_err)?;
        debug!(port, "Connected to zone");
        self.reader = Some(BufReader::new(reader));
        self.stream = Some(stream);
        Ok(())
    }

    fn stop_client(&mut self) {
        self.disconnect();
    }

    fn shutdown_and_reinitialize(&mut self) {
        self.disconnect();
        self.loaded.clear();
    }

    fn load_region(&mut self, region_name: &str) -> zoneweave_core::Result<()> {
        self.loaded.push_back(region_name.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PlaySummary {
    pub region_path: Option<String>,
    pub redirects: usize,
}

pub struct PlayOptions {
    pub character: String,
    pub start_region: String,
    pub moves: Vec<Position>,
    pub max_redirects: usize,
    pub read_timeout: Duration,
}

/// Joins `start_region` and walks through `moves`, one per idle read,
/// following every redirect. Stops once the moves run out and the zone goes
/// quiet.
pub fn run(config: &ZoneConfig, options: PlayOptions) -> Result<PlaySummary, CtlError> {
    let mut client = TcpRegionClient::new(config.bind_address.clone(), options.read_timeout);
    let mut handoff = HandoffClient::from_config(config, options.character);
    let mut moves: VecDeque<Position> = options.moves.into();
    let mut summary = PlaySummary::default();

    let port = handoff.connect(&mut client, &options.start_region)?;
    println!("connecting to {} on port {}", options.start_region, port);
    client.send(&ClientMessage::join(handoff.character_name()))?;

    loop {
        while let Some(region) = client.take_loaded() {
            if let Some(port) = handoff.on_region_loaded(&mut client, &region)? {
                println!("reconnecting to {} on port {}", region, port);
                client.send(&ClientMessage::join(handoff.character_name()))?;
            }
        }

        match client.next_message()? {
            Incoming::Message(ServerMessage::Welcome {
                region_path,
                position,
            }) => {
                handoff.on_connected();
                match position {
                    Some(position) => println!(
                        "joined {} at ({}, {}, {})",
                        region_path, position.x, position.y, position.z
                    ),
                    None => println!("joined {}", region_path),
                }
                summary.region_path = Some(region_path);
                send_next_move(&mut client, &mut moves)?;
            }
            Incoming::Message(ServerMessage::SwitchServer(redirect)) => {
                summary.redirects += 1;
                if summary.redirects > options.max_redirects {
                    return Err(CtlError::TooManyRedirects(options.max_redirects));
                }
                println!("redirected to {}", redirect.scene_path);
                handoff.on_redirect(&mut client, &redirect)?;
            }
            Incoming::Message(ServerMessage::Error(info)) => {
                return Err(CtlError::Server(info));
            }
            Incoming::Idle => {
                if handoff.phase() != ClientPhase::Connected {
                    continue;
                }
                if !send_next_move(&mut client, &mut moves)? {
                    break;
                }
            }
            Incoming::Closed => {
                handoff.on_disconnected();
                if handoff.phase() == ClientPhase::Idle {
                    println!("disconnected");
                    return Ok(summary);
                }
            }
        }
    }

    let _ = client.send(&ClientMessage::Leave);
    client.stop_client();
    Ok(summary)
}

fn send_next_move(
    client: &mut TcpRegionClient,
    moves: &mut VecDeque<Position>,
) -> Result<bool, CtlError> {
    let Some(position) = moves.pop_front() else {
        return Ok(false);
    };
    println!("moving to ({}, {}, {})", position.x, position.y, position.z);
    client.send(&ClientMessage::Move { position })?;
    Ok(true)
}
