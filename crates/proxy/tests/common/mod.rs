#![allow(dead_code)]

use anyhow::Context as _;
use std::io::BufRead as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Kills the proxy process when a test ends, pass or fail.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub struct SpawnedProxy {
    pub child: KillOnDrop,
    pub data_base: String,
    pub admin_base: String,
    pub log_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // Logs are JSON off-TTY; the address ends before the next quote or brace.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    let addr = rest[..end].trim();
    addr.parse::<SocketAddr>().ok().map(|a| a.to_string())
}

fn wait_for_ports(mut child: Child, timeout: Duration) -> anyhow::Result<(Child, String, String)> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let start = Instant::now();
    let mut data_addr: Option<String> = None;
    let mut admin_addr: Option<String> = None;
    let mut last_lines: Vec<String> = Vec::new();

    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!(
                "proxy process exited early: {status}; last output:\n{}",
                last_lines.join("\n")
            );
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line.clone());

                if data_addr.is_none() {
                    data_addr = parse_listen_addr(&line, "Starting data plane HTTP server on ");
                }
                if admin_addr.is_none() {
                    admin_addr = parse_listen_addr(&line, "Starting admin plane HTTP server on ");
                }
                if let (Some(d), Some(a)) = (data_addr.clone(), admin_addr.clone()) {
                    return Ok((child, format!("http://{d}"), format!("http://{a}")));
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    anyhow::bail!(
        "timed out waiting for proxy ports; last output:\n{}",
        last_lines.join("\n")
    );
}

/// Env vars the proxy reads; scrubbed before each spawn so ambient state from
/// the test runner cannot leak in.
const PROXY_ENV_VARS: &[&str] = &[
    "LOG_FILE",
    "AUDIT_LOG_BODIES",
    "MAX_STDIO_CONNECTIONS",
    "MAX_BODY_BYTES",
    "MAX_SESSIONS",
    "RPC_RESPONSE_TIMEOUT_SECONDS",
    "AI_INJECTION_THRESHOLD",
    "ADMIN_PORT",
    "PATTERNS_DIR",
    "DESTINATIONS_CONFIG",
    "SECRETS_CONFIG",
    "PALISADE_BIND",
];

/// Spawn the built proxy binary with a destinations file and extra env vars,
/// and wait for both planes to come up.
pub fn spawn_proxy(
    destinations_yaml: &str,
    extra_env: &[(&str, &str)],
) -> anyhow::Result<SpawnedProxy> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("destinations.yml");
    std::fs::write(&config_path, destinations_yaml)?;
    let log_path = dir.path().join("proxy.log");

    let bin = env!("CARGO_BIN_EXE_palisade");
    let mut cmd = Command::new(bin);
    cmd.arg("--config")
        .arg(&config_path)
        .arg("--bind")
        .arg("127.0.0.1:0")
        .arg("--admin-port")
        .arg("0")
        .arg("--log-level")
        .arg("info")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for name in PROXY_ENV_VARS {
        cmd.env_remove(name);
    }
    cmd.env("LOG_FILE", &log_path);
    for (k, v) in extra_env {
        cmd.env(k, v);
    }

    let child = cmd.spawn().context("spawn proxy")?;
    let (child, data_base, admin_base) = wait_for_ports(child, Duration::from_secs(10))?;

    Ok(SpawnedProxy {
        child: KillOnDrop(child),
        data_base,
        admin_base,
        log_path,
        _dir: dir,
    })
}

/// Parse every line of the audit log.
pub fn read_audit_lines(path: &Path) -> Vec<serde_json::Value> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Poll the audit log until `predicate` accepts it or the timeout lapses.
pub fn wait_for_audit<F>(path: &Path, timeout: Duration, predicate: F) -> Vec<serde_json::Value>
where
    F: Fn(&[serde_json::Value]) -> bool,
{
    let start = Instant::now();
    loop {
        let lines = read_audit_lines(path);
        if predicate(&lines) || start.elapsed() > timeout {
            return lines;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Run an axum router on an ephemeral loopback port for use as a mock
/// upstream.
pub async fn serve_mock(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    addr
}
