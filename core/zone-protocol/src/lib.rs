//! Wire protocol shared by zone servers and their clients.
//!
//! Messages are newline-delimited JSON. Servers stay the authority on what a
//! valid message is, but clients reuse the same types so the two sides cannot
//! drift apart.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::BufRead;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64KB
pub const MAX_CHARACTER_NAME_LEN: usize = 64;
pub const MAX_SCENE_PATH_LEN: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Tells a client to drop its connection and reconnect to the zone serving
/// `scene_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectMessage {
    pub scene_path: String,
    pub character_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl RedirectMessage {
    pub fn new(scene_path: impl Into<String>, character_name: impl Into<String>) -> Self {
        Self {
            scene_path: scene_path.into(),
            character_name: character_name.into(),
            token: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.scene_path.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "scenePath is required"));
        }
        if self.scene_path.len() > MAX_SCENE_PATH_LEN {
            return Err(ErrorInfo::new(
                "invalid_scene_path",
                format!("scenePath must be {} bytes or fewer", MAX_SCENE_PATH_LEN),
            ));
        }
        validate_character_name(&self.character_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        protocol_version: u32,
        character_name: String,
    },
    Move {
        position: Position,
    },
    Leave,
}

impl ClientMessage {
    pub fn join(character_name: impl Into<String>) -> Self {
        Self::Join {
            protocol_version: PROTOCOL_VERSION,
            character_name: character_name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            ClientMessage::Join {
                protocol_version,
                character_name,
            } => {
                if *protocol_version != PROTOCOL_VERSION {
                    return Err(ErrorInfo::new(
                        "protocol_mismatch",
                        "unsupported protocol version",
                    ));
                }
                validate_character_name(character_name)
            }
            ClientMessage::Move { position } => {
                if position.is_finite() {
                    Ok(())
                } else {
                    Err(ErrorInfo::new(
                        "invalid_position",
                        "position coordinates must be finite",
                    ))
                }
            }
            ClientMessage::Leave => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        region_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
    },
    SwitchServer(RedirectMessage),
    Error(ErrorInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub fn parse_client_message(line: &[u8]) -> Result<ClientMessage, ErrorInfo> {
    let message: ClientMessage = decode_line(line)?;
    message.validate()?;
    Ok(message)
}

pub fn parse_server_message(line: &[u8]) -> Result<ServerMessage, ErrorInfo> {
    let message: ServerMessage = decode_line(line)?;
    if let ServerMessage::SwitchServer(redirect) = &message {
        redirect.validate()?;
    }
    Ok(message)
}

/// Serializes one message as a single newline-terminated frame.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ErrorInfo> {
    let mut bytes = serde_json::to_vec(message).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("failed to serialize message: {}", err),
        )
    })?;
    if bytes.len() >= MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, ErrorInfo> {
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_message", "message body was empty"));
    }
    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("message was not valid JSON: {}", err),
        )
    })
}

/// Reads the next frame, without its trailing newline.
///
/// Returns `Ok(None)` on a clean end of stream. A frame longer than
/// [`MAX_MESSAGE_BYTES`] is an error; the stream should be dropped after it.
pub fn read_frame<R: BufRead>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if available.is_empty() {
            return Ok(if buffer.is_empty() { None } else { Some(buffer) });
        }

        match available.iter().position(|b| *b == b'\n') {
            Some(index) => {
                buffer.extend_from_slice(&available[..index]);
                reader.consume(index + 1);
                return Ok(Some(buffer));
            }
            None => {
                let len = available.len();
                buffer.extend_from_slice(available);
                reader.consume(len);
            }
        }

        if buffer.len() > MAX_MESSAGE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeded maximum size",
            ));
        }
    }
}

fn validate_character_name(name: &str) -> Result<(), ErrorInfo> {
    if name.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "characterName is required"));
    }
    if name.len() > MAX_CHARACTER_NAME_LEN {
        return Err(ErrorInfo::new(
            "invalid_character_name",
            format!(
                "characterName must be {} characters or fewer",
                MAX_CHARACTER_NAME_LEN
            ),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(ErrorInfo::new(
            "invalid_character_name",
            "characterName must not contain control characters",
        ));
    }
    Ok(())
}
