//! The WebSocket/PTY multiplexer.
//!
//! One socket path serves four session kinds, selected by the `action`
//! query parameter:
//!
//! * `exec` (default): interactive shell inside the service's container.
//! * `stop` / `restart`: run the lifecycle command in a PTY so the user
//!   watches the output live; the transient-state protocol applies.
//! * `inspect`: recent log history, then a follow loop that survives
//!   container restarts, with an idle countdown.
//! * `log`: the proxy access log, filtered to the service's upstream
//!   address, one JSON record per matched line.
//!
//! Per session, socket reads are serialized into PTY writes and PTY output
//! is serialized into socket sends; sessions are independent of each other.
//! Closing the socket tears down the child and every timer. PTY-backed
//! sessions (exec/stop/restart) hold the active-terminal counter, which
//! parks the reconciler for their duration.

use crate::discovery::ProjectRef;
use crate::lifecycle::{project_key, TransientState, RESTART_SCRIPT, STOP_SCRIPT};
use crate::projects;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use serde::Deserialize;
use serde_json::json;
use stackd_core::access_log;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::debug;

const IDLE_LIMIT: Duration = Duration::from_secs(60);
const COUNTDOWN_SECS: u32 = 5;
const RESPAWN_DELAY: Duration = Duration::from_secs(3);
const HISTORY_LINES: u32 = 500;
const TAIL_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    /// Project path (or its manifest path) relative to the workspace root.
    pub file: String,
    pub service: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// The only recognized control frame; everything else is raw keyboard
/// bytes for the PTY.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: u16,
    #[serde(default)]
    rows: u16,
}

type WsSink = SplitSink<WebSocket, Message>;

pub async fn handle_session(state: Arc<AppState>, socket: WebSocket, query: AttachQuery) {
    let action = query.action.as_deref().unwrap_or("exec");
    debug!("ws attach: action={action} file={} service={}", query.file, query.service);

    let project = match resolve(&state, &query.file) {
        Ok(project) => project,
        Err(msg) => return close_with(socket, &msg).await,
    };

    match action {
        "exec" => exec_session(&state, socket, &project, &query.service).await,
        "stop" => lifecycle_session(&state, socket, &project, &query.service, TransientState::Stopping).await,
        "restart" => {
            lifecycle_session(&state, socket, &project, &query.service, TransientState::Restarting)
                .await;
        }
        "inspect" => inspect_session(&state, socket, &project, &query.service).await,
        "log" => log_session(&state, socket, &project, &query).await,
        other => close_with(socket, &format!("unknown action: {other}")).await,
    }
}

fn resolve(state: &AppState, file: &str) -> Result<ProjectRef, String> {
    let rel = file
        .strip_suffix(state.config.compose_file.as_str())
        .map(|s| s.trim_end_matches('/'))
        .unwrap_or(file);
    projects::resolve_project(&state.config, rel).map_err(|e| e.to_string())
}

async fn close_with(mut socket: WebSocket, msg: &str) {
    let _ = socket
        .send(Message::Text(format!("\r\n[stackd] {msg}\r\n")))
        .await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_banner(sink: &mut WsSink, msg: &str) -> bool {
    sink.send(Message::Text(format!("\r\n[stackd] {msg}\r\n")))
        .await
        .is_ok()
}

// ---------------------------------------------------------------------------
// exec / stop / restart: PTY-backed sessions
// ---------------------------------------------------------------------------

async fn exec_session(state: &Arc<AppState>, socket: WebSocket, project: &ProjectRef, service: &str) {
    let container = match state.lifecycle.container_id(project, service).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            return close_with(socket, &format!("{service} has no running container")).await;
        }
        Err(e) => return close_with(socket, &format!("cannot resolve container: {e:#}")).await,
    };

    let mut cmd = CommandBuilder::new("docker");
    cmd.args(["exec", "-it", container.as_str(), "/bin/sh"]);
    let label = format!("{}/{service}", project.rel);
    pty_session(state, socket, cmd, &label, true).await;
}

async fn lifecycle_session(
    state: &Arc<AppState>,
    socket: WebSocket,
    project: &ProjectRef,
    service: &str,
    transition: TransientState,
) {
    if let Err(e) = state.lifecycle.begin_transition(project, service, transition) {
        return close_with(socket, &e.to_string()).await;
    }

    let verb = match transition {
        TransientState::Restarting => "restart",
        TransientState::Stopping => "stop",
    };
    let script_name = match transition {
        TransientState::Restarting => RESTART_SCRIPT,
        TransientState::Stopping => STOP_SCRIPT,
    };

    let script = project.dir.join(script_name);
    let mut cmd = if stackd_utils::cmd::is_executable(&script) {
        let mut cmd = CommandBuilder::new(script);
        cmd.arg(service);
        cmd.cwd(&project.dir);
        cmd
    } else {
        let manifest = state.config.manifest_path(&project.dir);
        let mut cmd = CommandBuilder::new("docker");
        cmd.args(["compose", "-f"]);
        cmd.arg(manifest);
        cmd.args([verb, service]);
        cmd
    };
    cmd.env("COMPOSE_PROJECT_NAME", project_key(project.folder_name()));

    let label = format!("{}/{service} ({verb})", project.rel);
    pty_session(state, socket, cmd, &label, false).await;
    state.lifecycle.settle_transition(project, service, transition);
}

/// Run one PTY-backed session: pump PTY output to the socket and (when
/// interactive) socket input to the PTY, until either side ends.
async fn pty_session(
    state: &Arc<AppState>,
    socket: WebSocket,
    cmd: CommandBuilder,
    label: &str,
    interactive: bool,
) {
    let pty = NativePtySystem::default();
    let pair = match pty.openpty(PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(e) => return close_with(socket, &format!("failed to open PTY: {e}")).await,
    };

    let mut child: Box<dyn Child + Send> = match pair.slave.spawn_command(cmd) {
        Ok(child) => child,
        Err(e) => return close_with(socket, &format!("failed to spawn: {e}")).await,
    };
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => return close_with(socket, &format!("failed to read PTY: {e}")).await,
    };
    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(e) => return close_with(socket, &format!("failed to write PTY: {e}")).await,
    };

    // Reconciler stays parked while this guard lives; released exactly once.
    let guard = state.terminals.acquire();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let master: StdMutex<Box<dyn MasterPty + Send>> = StdMutex::new(pair.master);
    let writer: StdMutex<Box<dyn Write + Send>> = StdMutex::new(writer);

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(bytes) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                // PTY reached EOF: the child is gone.
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) if interactive => {
                    handle_input(&text, &master, &writer);
                }
                Some(Ok(Message::Binary(data))) if interactive => {
                    write_pty(&writer, &data);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    stackd_utils::process::terminate_gracefully(&mut child, label, Signal::SIGTERM).await;
    guard.release();
    let _ = ws_tx.send(Message::Close(None)).await;
}

fn handle_input(
    text: &str,
    master: &StdMutex<Box<dyn MasterPty + Send>>,
    writer: &StdMutex<Box<dyn Write + Send>>,
) {
    if text.trim_start().starts_with('{') {
        if let Ok(frame) = serde_json::from_str::<ControlFrame>(text) {
            if frame.kind == "resize" && frame.cols > 0 && frame.rows > 0 {
                if let Ok(master) = master.lock() {
                    let _ = master.resize(PtySize {
                        rows: frame.rows,
                        cols: frame.cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    });
                }
                return;
            }
        }
    }
    write_pty(writer, text.as_bytes());
}

fn write_pty(writer: &StdMutex<Box<dyn Write + Send>>, data: &[u8]) {
    if let Ok(mut writer) = writer.lock() {
        if writer.write_all(data).and_then(|()| writer.flush()).is_err() {
            debug!("PTY writer closed");
        }
    }
}

// ---------------------------------------------------------------------------
// inspect: history + follow loop with idle countdown
// ---------------------------------------------------------------------------

async fn inspect_session(
    state: &Arc<AppState>,
    socket: WebSocket,
    project: &ProjectRef,
    service: &str,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Recent history first, bounded wait; a failure is reported but the
    // follow loop still runs (the container may just be starting).
    match state
        .lifecycle
        .log_history(project, service, HISTORY_LINES)
        .await
    {
        Ok(history) if !history.is_empty() => {
            if ws_tx.send(Message::Text(history)).await.is_err() {
                return;
            }
        }
        Ok(_) => {}
        Err(e) => {
            if !send_banner(&mut ws_tx, &format!("history unavailable: {e:#}")).await {
                return;
            }
        }
    }

    let activity = Arc::new(StdMutex::new(Instant::now()));
    let last_seen: Arc<StdMutex<Option<DateTime<Utc>>>> = Arc::new(StdMutex::new(None));
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let follow = tokio::spawn(follow_logs(
        state.config.manifest_path(&project.dir),
        project_key(project.folder_name()),
        service.to_string(),
        tx,
        Arc::clone(&activity),
        Arc::clone(&last_seen),
    ));

    let mut idle = tokio::time::interval(Duration::from_secs(1));
    'session: loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(bytes) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break 'session;
                    }
                }
                None => break 'session,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break 'session,
                Some(Ok(_)) => {}
            },
            _ = idle.tick() => {
                let idle_for = activity.lock().map(|t| t.elapsed()).unwrap_or_default();
                if idle_for < IDLE_LIMIT {
                    continue;
                }
                // Visible countdown; any byte from the stream cancels it.
                let mut cancelled = false;
                for remaining in (1..=COUNTDOWN_SECS).rev() {
                    let note = format!("no output for a while, closing in {remaining}s");
                    if !send_banner(&mut ws_tx, &note).await {
                        break 'session;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let idle_for = activity.lock().map(|t| t.elapsed()).unwrap_or_default();
                    if idle_for < IDLE_LIMIT {
                        cancelled = true;
                        break;
                    }
                }
                if !cancelled {
                    break 'session;
                }
                let _ = send_banner(&mut ws_tx, "new output, staying attached").await;
            },
        }
    }

    follow.abort();
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Follow the service log, respawning the child when it exits (typically
/// because the container restarted). Replays nothing: each respawn asks
/// only for lines since the last data seen.
async fn follow_logs(
    manifest: PathBuf,
    key: String,
    service: String,
    tx: mpsc::Sender<Vec<u8>>,
    activity: Arc<StdMutex<Instant>>,
    last_seen: Arc<StdMutex<Option<DateTime<Utc>>>>,
) {
    loop {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&manifest)
            .arg("logs")
            .arg("-f")
            .arg("--no-color");
        let since = last_seen.lock().ok().and_then(|g| *g);
        match since {
            Some(ts) => {
                cmd.arg("--since").arg(ts.to_rfc3339());
            }
            None => {
                cmd.arg("--tail").arg("0");
            }
        }
        cmd.arg(&service)
            .env("COMPOSE_PROJECT_NAME", &key)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let Ok(mut child) = cmd.spawn() else {
            tokio::time::sleep(RESPAWN_DELAY).await;
            continue;
        };

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut t) = activity.lock() {
                            *t = Instant::now();
                        }
                        if let Ok(mut seen) = last_seen.lock() {
                            *seen = Some(Utc::now());
                        }
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
            }
        }
        let _ = child.wait().await;
        // Child gone, usually a container restart; come back quietly.
        tokio::time::sleep(RESPAWN_DELAY).await;
    }
}

// ---------------------------------------------------------------------------
// log: filtered access-log stream
// ---------------------------------------------------------------------------

async fn log_session(
    state: &Arc<AppState>,
    socket: WebSocket,
    project: &ProjectRef,
    query: &AttachQuery,
) {
    let ip = match &query.ip {
        Some(ip) => ip.clone(),
        None => {
            let index = state.mapper.snapshot().await;
            match index.service_ip(&project.rel, &query.service) {
                Some(ip) => ip.to_string(),
                None => {
                    return close_with(
                        socket,
                        &format!("no upstream address known for {}", query.service),
                    )
                    .await;
                }
            }
        }
    };
    if ip.parse::<std::net::Ipv4Addr>().is_err() {
        return close_with(socket, &format!("invalid address: {ip}")).await;
    }

    let (tx, mut rx) = mpsc::channel::<String>(256);
    let tails: Vec<_> = state
        .config
        .access_logs
        .iter()
        .map(|path| tokio::spawn(tail_access_log(path.clone(), ip.clone(), tx.clone())))
        .collect();
    drop(tx);

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    for tail in tails {
        tail.abort();
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Poll-follow one access log from its current end, forwarding matched
/// lines as JSON. Handles truncation/rotation by starting over at zero.
async fn tail_access_log(path: PathBuf, ip: String, tx: mpsc::Sender<String>) {
    let mut pos = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    let mut partial = String::new();
    let mut poll = tokio::time::interval(TAIL_POLL);

    loop {
        poll.tick().await;
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let len = meta.len();
        if len < pos {
            pos = 0;
            partial.clear();
        }
        if len == pos {
            continue;
        }

        let Ok(mut file) = tokio::fs::File::open(&path).await else {
            continue;
        };
        if file.seek(std::io::SeekFrom::Start(pos)).await.is_err() {
            continue;
        }
        let mut buf = Vec::with_capacity((len - pos) as usize);
        let mut limited = file.take(len - pos);
        if limited.read_to_end(&mut buf).await.is_err() {
            continue;
        }
        pos = len;
        partial.push_str(&String::from_utf8_lossy(&buf));

        while let Some(newline) = partial.find('\n') {
            let line: String = partial.drain(..=newline).collect();
            let line = line.trim_end();
            if line.is_empty() || !access_log::matches_upstream(line, &ip) {
                continue;
            }
            let payload = match access_log::parse_line(line) {
                Some(record) => serde_json::to_string(&record)
                    .unwrap_or_else(|_| json!({ "raw": line }).to_string()),
                None => json!({ "raw": line }).to_string(),
            };
            if tx.send(payload).await.is_err() {
                return;
            }
        }
    }
}
