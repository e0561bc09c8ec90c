use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use zoneweave_core::store::{CharacterPersistence, LivenessStore, ZoneOnline};
use zoneweave_core::Db;
use zoneweave_protocol::{
    encode_line, parse_server_message, read_frame, ClientMessage, Position, RedirectMessage,
    ServerMessage,
};

struct ZoneGuard {
    child: Child,
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn write_config(dir: &Path, base_port: u16, liveness: &str, spawn_siblings: bool) -> PathBuf {
    let path = dir.join("zones.toml");
    let config = format!(
        r#"
zone_id = "World1"
regions = ["World1.unity", "World2.unity"]
base_port = {base_port}
data_dir = "{data_dir}"
spawn_siblings = {spawn_siblings}

[liveness]
{liveness}

[[portals]]
name = "east_gate"
region = "World1.unity"
min = [4.0, -1.0, 4.0]
max = [6.0, 1.0, 6.0]
destination = "World2.unity"
arrival = [1.0, 0.0, 1.0]
"#,
        base_port = base_port,
        data_dir = dir.display(),
        liveness = liveness,
        spawn_siblings = spawn_siblings,
    );
    std::fs::write(&path, config).expect("write config");
    path
}

fn spawn_zone(home: &Path, config: &Path, extra_args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_zone-node"))
        .arg("-config")
        .arg(config)
        .args(extra_args)
        .env("HOME", home)
        .env_remove("ZONEWEAVE_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn zone-node")
}

fn connect(port: u16, timeout: Duration) -> TcpStream {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("set read timeout");
            return stream;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for zone on port {}", port);
}

fn send(stream: &mut TcpStream, message: &ClientMessage) {
    let bytes = encode_line(message).expect("encode");
    stream.write_all(&bytes).expect("write message");
    stream.flush().ok();
}

fn receive(reader: &mut BufReader<TcpStream>) -> ServerMessage {
    let line = read_frame(reader)
        .expect("read frame")
        .expect("connection closed early");
    parse_server_message(&line).expect("parse server message")
}

#[test]
fn leader_welcomes_new_player_and_redirects_at_portal() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(home.path(), port, "write_interval_secs = 1.0", false);
    let _guard = ZoneGuard {
        child: spawn_zone(home.path(), &config, &[]),
    };

    let mut stream = connect(port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    send(&mut stream, &ClientMessage::join("Bob"));
    match receive(&mut reader) {
        ServerMessage::Welcome { region_path, .. } => assert_eq!(region_path, "World1.unity"),
        other => panic!("expected welcome, got {:?}", other),
    }

    send(
        &mut stream,
        &ClientMessage::Move {
            position: Position::new(5.0, 0.0, 5.0),
        },
    );
    assert_eq!(
        receive(&mut reader),
        ServerMessage::SwitchServer(RedirectMessage::new("World2.unity", "Bob"))
    );

    let db = Db::new(home.path().join("zones.db")).expect("open db");
    assert_eq!(
        db.get_last_known_region("Bob").expect("read"),
        Some("World2.unity".to_string())
    );
    let saved = db
        .get_character_position("Bob")
        .expect("read")
        .expect("arrival saved");
    assert_eq!(saved.position, Position::new(1.0, 0.0, 1.0));
}

#[test]
fn leader_redirects_character_recorded_in_another_zone() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(home.path(), port, "write_interval_secs = 1.0", false);

    let db = Db::new(home.path().join("zones.db")).expect("open db");
    db.record_region("Alice", "World2.unity").expect("record");

    let _guard = ZoneGuard {
        child: spawn_zone(home.path(), &config, &[]),
    };
    let mut stream = connect(port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    send(&mut stream, &ClientMessage::join("Alice"));
    let message = receive(&mut reader);
    let value = serde_json::to_value(&message).expect("serialize");
    assert_eq!(value["type"], "switch_server");
    assert_eq!(value["scenePath"], "World2.unity");
    assert_eq!(value["characterName"], "Alice");

    // The character was destroyed here, so moving is refused.
    send(
        &mut stream,
        &ClientMessage::Move {
            position: Position::new(0.0, 0.0, 0.0),
        },
    );
    match receive(&mut reader) {
        ServerMessage::Error(info) => assert_eq!(info.code, "not_joined"),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn invalid_messages_get_an_error_reply() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(home.path(), port, "write_interval_secs = 1.0", false);
    let _guard = ZoneGuard {
        child: spawn_zone(home.path(), &config, &[]),
    };

    let mut stream = connect(port, Duration::from_secs(5));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    stream.write_all(b"not json\n").expect("write");

    match receive(&mut reader) {
        ServerMessage::Error(info) => assert_eq!(info.code, "invalid_json"),
        other => panic!("expected error, got {:?}", other),
    }
}

#[test]
fn sibling_without_leader_heartbeat_exits() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(
        home.path(),
        port,
        "write_interval_secs = 1.0\ntimeout_multiplier = 2.0",
        false,
    );
    let mut guard = ZoneGuard {
        child: spawn_zone(home.path(), &config, &["-scenePath", "World1.unity"]),
    };

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        match guard.child.try_wait().expect("poll zone") {
            Some(status) => {
                assert!(status.success(), "zone exited with {}", status);
                break;
            }
            None if Instant::now() < deadline => sleep(Duration::from_millis(100)),
            None => panic!("sibling zone kept running without a leader"),
        }
    }
}

fn leader_stamp(db: &Db) -> Option<chrono::DateTime<chrono::Utc>> {
    match db.zone_online_time("World1").expect("read liveness") {
        ZoneOnline::Online(at) => Some(at),
        _ => None,
    }
}

#[test]
fn client_that_never_reads_does_not_stall_the_heartbeat() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(home.path(), port, "write_interval_secs = 1.0", false);
    let _guard = ZoneGuard {
        child: spawn_zone(home.path(), &config, &[]),
    };

    let mut flooder = connect(port, Duration::from_secs(5));
    let db = Db::new(home.path().join("zones.db")).expect("open db");
    let deadline = Instant::now() + Duration::from_secs(5);
    let before = loop {
        if let Some(at) = leader_stamp(&db) {
            break at;
        }
        assert!(Instant::now() < deadline, "leader never stamped liveness");
        sleep(Duration::from_millis(50));
    };

    // Every line is invalid, so each one earns an error reply that is never read.
    flooder
        .set_write_timeout(Some(Duration::from_secs(2)))
        .expect("set write timeout");
    let flood = thread::spawn(move || {
        let chunk = b"x\n".repeat(4096);
        for _ in 0..100 {
            if flooder.write_all(&chunk).is_err() {
                break;
            }
        }
        flooder
    });

    sleep(Duration::from_secs(3));
    let after = leader_stamp(&db).expect("leader still stamped");
    assert!(after > before, "heartbeat stopped advancing");
    let age = chrono::Utc::now().signed_duration_since(after);
    assert!(
        age < chrono::Duration::seconds(2),
        "leader stamp is {}ms old",
        age.num_milliseconds()
    );

    let _flooder = flood.join().expect("flood thread");
}

fn join_when_ready(port: u16, character: &str, timeout: Duration) -> ServerMessage {
    let deadline = Instant::now() + timeout;
    loop {
        let mut stream = connect(port, timeout);
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        send(&mut stream, &ClientMessage::join(character));
        match receive(&mut reader) {
            ServerMessage::Error(info)
                if info.code == "region_loading" && Instant::now() < deadline =>
            {
                sleep(Duration::from_millis(100));
            }
            other => return other,
        }
    }
}

#[test]
fn leader_spawns_sibling_that_serves_its_region_until_the_leader_dies() {
    let home = TempDir::new().expect("temp HOME");
    let port = free_port();
    let config = write_config(
        home.path(),
        port,
        "write_interval_secs = 1.0\ntimeout_multiplier = 2.0",
        true,
    );
    let mut leader = ZoneGuard {
        child: spawn_zone(home.path(), &config, &[]),
    };

    let sibling_port = port + 1;
    match join_when_ready(sibling_port, "Carol", Duration::from_secs(10)) {
        ServerMessage::Welcome { region_path, .. } => assert_eq!(region_path, "World2.unity"),
        other => panic!("expected welcome from sibling, got {:?}", other),
    }

    leader.child.kill().expect("kill leader");
    leader.child.wait().expect("reap leader");

    let deadline = Instant::now() + Duration::from_secs(15);
    while TcpStream::connect(("127.0.0.1", sibling_port)).is_ok() {
        assert!(
            Instant::now() < deadline,
            "sibling zone outlived its leader"
        );
        sleep(Duration::from_millis(200));
    }
}
