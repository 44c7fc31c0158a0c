/// mpv playback channel for previews.
///
/// ```text
///   PreviewPlayer::ensure()
///         │
///         ├── writer_task   ← IpcRequest via mpsc, serialised → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── reply (has request_id) → oneshot
///                                └── event                  → event_tx
/// ```
///
/// mpv runs idle with no video and is spawned lazily on the first clip.
/// A dead process is detected on the next use and replaced.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct IpcRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv message.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// True when the current file played to its natural end.
    pub fn is_eof(&self) -> bool {
        self.event_name() == Some("end-file")
            && self.raw.get("reason").and_then(Value::as_str) == Some("eof")
    }
}

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<IpcRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                req_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace whatever is loaded with `url`, starting at `start_secs`.
    pub async fn load_clip(&self, url: &str, start_secs: f64) -> anyhow::Result<()> {
        let start = format!("{:.3}", start_secs.max(0.0));
        self.send(json!(["set_property", "start", start])).await?;
        self.send(json!(["loadfile", url, "replace"])).await?;
        self.set_pause(false).await
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Current position in seconds, if anything is loaded.
    pub async fn time_pos(&self) -> Option<f64> {
        match self.send(json!(["get_property", "time-pos"])).await {
            Ok(resp) => resp["data"].as_f64(),
            Err(e) => {
                debug!("mpv: time-pos unavailable: {}", e);
                None
            }
        }
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }
}

/// Owns the mpv child process for the preview channel.
pub struct PreviewPlayer {
    socket_name: String,
    process: Option<tokio::process::Child>,
    handle: Option<MpvHandle>,
    event_tx: mpsc::Sender<MpvEvent>,
}

impl PreviewPlayer {
    /// Events from every connection this player makes go to `event_tx`.
    pub fn new(event_tx: mpsc::Sender<MpvEvent>) -> Self {
        Self {
            socket_name: scrobble_proto::platform::mpv_socket_name(),
            process: None,
            handle: None,
            event_tx,
        }
    }

    fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    /// The live handle, if mpv is already running.
    pub fn handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.process_alive() {
            warn!("mpv: process died, dropping handle");
            self.handle = None;
        }
        self.handle.clone()
    }

    /// The live handle, spawning mpv if needed.
    pub async fn ensure(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        let handle = self.spawn_and_connect().await?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop().await;
        }
        if let Some(mut child) = self.process.take() {
            let _ = child.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let binary = scrobble_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {:?}", binary);
        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=no")
            .arg(scrobble_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    async fn spawn_and_connect(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(mut stale) = self.process.take() {
            let _ = stale.kill().await;
        }
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process()?;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to {:?}", socket_path);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, self.event_tx.clone()))
    }

    #[cfg(windows)]
    async fn spawn_and_connect(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(mut stale) = self.process.take() {
            let _ = stale.kill().await;
        }
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, self.event_tx.clone()));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<IpcRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));
    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };
                match val.get("request_id").and_then(Value::as_u64) {
                    Some(req_id) => {
                        let Some(tx) = pending.lock().await.remove(&req_id) else {
                            debug!("mpv reader: reply for unknown req={}", req_id);
                            continue;
                        };
                        let result = match val["error"].as_str() {
                            Some("success") => Ok(val),
                            other => Err(anyhow::anyhow!(
                                "mpv error: {}",
                                other.unwrap_or("unknown error")
                            )),
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                            debug!("mpv reader: event receiver gone");
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<IpcRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Answers every command with success, echoing the command name as data,
    /// and pushes one end-file event after the first reply.
    async fn fake_mpv(stream: tokio::io::DuplexStream) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let mut first = true;
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let data = if req["command"][1] == "time-pos" {
                json!(12.5)
            } else {
                req["command"][0].clone()
            };
            let reply = json!({ "request_id": req["request_id"], "error": "success", "data": data });
            write_half
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            if first {
                first = false;
                write_half
                    .write_all(b"{\"event\":\"end-file\",\"reason\":\"eof\"}\n")
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_replies_and_events_are_routed() {
        let (client, server) = duplex(4096);
        tokio::spawn(fake_mpv(server));
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (read_half, write_half) = tokio::io::split(client);
        let handle = start_io_tasks(read_half, write_half, event_tx);

        handle.load_clip("https://audio.example/a.m4a", 15.0).await.unwrap();
        assert_eq!(handle.time_pos().await, Some(12.5));

        let evt = event_rx.recv().await.unwrap();
        assert!(evt.is_eof());
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending() {
        let (client, server) = duplex(4096);
        drop(server);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (read_half, write_half) = tokio::io::split(client);
        let handle = start_io_tasks(read_half, write_half, event_tx);
        assert!(handle.stop().await.is_err());
    }
}
