use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn vgpud(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vgpud"));
    cmd.env("VGPUD_CONFIG_DIR", home.join("config"))
        .env("VGPUD_RUNTIME_DIR", home.join("run"))
        .env_remove("VGPUD_CONFIG")
        .env_remove("VGPUD_SOCKET")
        .env_remove("RUST_LOG");
    cmd
}

struct Server {
    child: Child,
    socket: PathBuf,
}

impl Server {
    fn start(home: &Path, extra: &[&str]) -> Self {
        let socket = home.join("run/vgpud.sock");
        let child = vgpud(home)
            .args(["--backend", "null"])
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start vgpud");
        let deadline = Instant::now() + Duration::from_secs(10);
        while UnixStream::connect(&socket).is_err() {
            assert!(Instant::now() < deadline, "vgpud never started listening");
            thread::sleep(Duration::from_millis(20));
        }
        Self { child, socket }
    }

    fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn send(stream: &mut UnixStream, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
    stream.write_all(&bytes).unwrap();
}

fn read_word(stream: &mut UnixStream) -> u32 {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes).unwrap();
    u32::from_ne_bytes(bytes)
}

#[test]
fn check_config_accepts_a_valid_file() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("vgpud.toml");
    fs::write(&file, "version = 1\nbackend = \"null\"\nbusy_wait_poll = \"5ms\"\n").unwrap();

    let output = vgpud(home.path())
        .args(["check-config"])
        .arg(&file)
        .output()
        .expect("failed to run vgpud check-config");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("backend = \"null\""), "{stdout}");
    assert!(stdout.contains("busy_wait_poll = \"5ms\""), "{stdout}");
}

#[test]
fn check_config_rejects_an_invalid_file() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("vgpud.toml");
    fs::write(&file, "version = 1\nmax_connections = 0\n").unwrap();

    let output = vgpud(home.path())
        .args(["check-config"])
        .arg(&file)
        .output()
        .expect("failed to run vgpud check-config");
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("max_connections"), "{stderr}");
}

#[test]
fn caps_json_reports_version_two() {
    let home = TempDir::new().unwrap();
    let output = vgpud(home.path())
        .args(["caps", "--json", "--backend", "null"])
        .output()
        .expect("failed to run vgpud caps");
    assert!(output.status.success());
    let caps: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(caps["v1"]["max_version"], 2);
    assert_eq!(caps["host_feature_check_version"], 3);
}

#[test]
fn serves_caps_over_the_socket() {
    let home = TempDir::new().unwrap();
    let server = Server::start(home.path(), &[]);
    let mut stream = server.connect();

    send(&mut stream, &[0, 1, 0, 2]);
    let size_plus_one = read_word(&mut stream);
    assert_eq!(read_word(&mut stream), 2);
    let mut blob = vec![0u8; size_plus_one as usize - 1];
    stream.read_exact(&mut blob).unwrap();
    assert_eq!(u32::from_ne_bytes([blob[0], blob[1], blob[2], blob[3]]), 2);
}

#[test]
fn config_file_sets_the_socket_path() {
    let home = TempDir::new().unwrap();
    let socket = home.path().join("custom/virgl.sock");
    let file = home.path().join("server.toml");
    fs::write(
        &file,
        format!("version = 1\nsocket_path = \"{}\"\n", socket.display()),
    )
    .unwrap();

    let mut child = vgpud(home.path())
        .args(["--backend", "null", "--config"])
        .arg(&file)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while UnixStream::connect(&socket).is_err() {
        assert!(Instant::now() < deadline, "vgpud never bound the configured socket");
        thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn clients_beyond_the_limit_are_refused() {
    let home = TempDir::new().unwrap();
    let server = Server::start(home.path(), &["--max-connections", "1"]);

    // The probe connection from start() may still hold the only slot.
    let mut first = loop {
        let mut stream = server.connect();
        send(&mut stream, &[0, 1, 2, 8, 0, 0]);
        let mut reply = [0u8; 12];
        if stream.read_exact(&mut reply).is_ok() {
            break stream;
        }
        thread::sleep(Duration::from_millis(20));
    };

    let mut second = server.connect();
    let mut rest = Vec::new();
    let _ = second.write_all(&[0u8; 8]);
    second.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    send(&mut first, &[2, 8, 0, 0]);
    assert_eq!(read_word(&mut first), 1);
}
