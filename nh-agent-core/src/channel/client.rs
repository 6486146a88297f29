use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use crate::alarms::{Alarm, AlarmSet};
use crate::archive_manager::ArchiveManager;
use crate::channel::auth::{self, ConnectAuth};
use crate::channel::console::{Downloader, RemoteShell, UploadChunk, Uploader};
use crate::channel::extensions::ExtensionsRegistry;
use crate::channel::protocol::{ChannelBuilder, Message};
use crate::channel::script_runner;
use crate::config::Config;
use crate::error::{ChannelError, ChannelResult};
use crate::hal::{NetworkObserver, SlotStore};
use crate::policy::Policy;
use crate::types::{
    ArchiveInfo, DeviceJoinParams, FwupProgress, NetworkInterface, PublicKey, PublicKeySet,
    StatusUpdate, UpdateInfo,
};
use crate::update_manager::UpdateManager;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The persistent authenticated WebSocket connection multiplexing the
/// `device`, `console`, and `extensions` topics, per spec 4.1.
pub struct ChannelClient {
    config: Arc<Config>,
    policy: Arc<dyn Policy>,
    update_manager: Arc<UpdateManager>,
    archive_manager: Arc<ArchiveManager>,
    extensions: Arc<ExtensionsRegistry>,
    slot_store: Arc<dyn SlotStore>,
    network: Arc<dyn NetworkObserver>,
    alarms: Arc<AlarmSet>,
    fwup_keys: Mutex<PublicKeySet>,
    archive_keys: Mutex<PublicKeySet>,
    last_reported_interface: Mutex<Option<NetworkInterface>>,
    shell: Mutex<Option<RemoteShell>>,
    file_download: Mutex<Option<Downloader>>,
    console_out_tx: mpsc::Sender<Vec<u8>>,
    console_out_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    status_rx: Mutex<mpsc::UnboundedReceiver<StatusUpdate>>,
    progress_rx: Mutex<mpsc::UnboundedReceiver<FwupProgress>>,
    upload_tx: mpsc::UnboundedSender<UploadFrame>,
    upload_rx: Mutex<mpsc::UnboundedReceiver<UploadFrame>>,
}

/// One outbound frame of a `send_file` transfer, produced by the background
/// task driving `console::Uploader` and consumed by the event loop, which
/// is the only place holding the live WebSocket sink.
enum UploadFrame {
    Start { filename: String },
    Chunk { filename: String, chunk: UploadChunk },
    Stop { filename: String },
}

impl ChannelClient {
    /// `status_rx`/`progress_rx` are the receiving ends of the channels
    /// whose senders were already handed to the `UpdateManager` at
    /// construction time (the two are built together by the supervisor).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        policy: Arc<dyn Policy>,
        update_manager: Arc<UpdateManager>,
        archive_manager: Arc<ArchiveManager>,
        extensions: Arc<ExtensionsRegistry>,
        slot_store: Arc<dyn SlotStore>,
        network: Arc<dyn NetworkObserver>,
        alarms: Arc<AlarmSet>,
        status_rx: mpsc::UnboundedReceiver<StatusUpdate>,
        progress_rx: mpsc::UnboundedReceiver<FwupProgress>,
    ) -> Self {
        let (console_out_tx, console_out_rx) = mpsc::channel(64);
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        Self {
            fwup_keys: Mutex::new(PublicKeySet(config.fwup_public_keys.clone())),
            archive_keys: Mutex::new(PublicKeySet(config.archive_public_keys.clone())),
            config,
            policy,
            update_manager,
            archive_manager,
            extensions,
            slot_store,
            network,
            alarms,
            last_reported_interface: Mutex::new(None),
            shell: Mutex::new(None),
            file_download: Mutex::new(None),
            console_out_tx,
            console_out_rx: Mutex::new(console_out_rx),
            status_rx: Mutex::new(status_rx),
            progress_rx: Mutex::new(progress_rx),
            upload_tx,
            upload_rx: Mutex::new(upload_rx),
        }
    }

    /// Streams `path` to the server over the console topic as `file-data/*`
    /// frames, per spec 4.7. The device must have an active console channel
    /// for the frames to actually be delivered; the transfer runs in the
    /// background and its frames are picked up by the event loop.
    pub fn send_file(self: &Arc<Self>, path: PathBuf) {
        let tx = self.upload_tx.clone();
        tokio::spawn(async move {
            let uploader = match Uploader::prepare(&path).await {
                Ok(uploader) => uploader,
                Err(err) => {
                    warn!(%err, path = %path.display(), "send_file: could not prepare upload");
                    return;
                }
            };
            let filename = uploader.filename.clone();
            if tx.send(UploadFrame::Start { filename: filename.clone() }).is_err() {
                return;
            }
            let result = Uploader::stream(&path, |chunk| {
                let _ = tx.send(UploadFrame::Chunk { filename: filename.clone(), chunk });
            })
            .await;
            if let Err(err) = result {
                warn!(%err, path = %path.display(), "send_file: upload stream failed");
            }
            let _ = tx.send(UploadFrame::Stop { filename });
        });
    }

    /// The alarm set backing this client, for supervisors that want to
    /// observe it directly (e.g. in tests).
    pub fn alarms(&self) -> &AlarmSet {
        &self.alarms
    }

    /// Runs the connect -> join -> event loop -> (on failure) backoff cycle
    /// forever. Returning from this function means the supervisor asked us
    /// to stop.
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut backoff = self.policy.reconnect_backoff();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("channel client shutting down");
                    return;
                }
                result = self.connect_and_run() => {
                    match result {
                        Ok(()) => {
                            info!("channel client stopped cleanly");
                        }
                        Err(err) => {
                            self.alarms.set(Alarm::Disconnected);
                            self.policy.handle_error(&err.to_string()).await;
                            warn!(%err, "channel client disconnected, will reconnect");
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_and_run(self: &Arc<Self>) -> ChannelResult<()> {
        if self.config.wait_for_network {
            self.wait_for_network().await;
        }

        let host = self.config.sni.clone().unwrap_or_else(|| self.config.server_url.clone());
        let mut ws = self.connect(&host).await?;

        let device_topic = "device".to_string();
        let device_channel = ChannelBuilder::new(device_topic.clone(), "1".to_string());
        let join_params = self.device_join_params().await;
        let join_msg = device_channel.join(serde_json::to_value(&join_params).map_err(|e| {
            ChannelError::MessageParsing(e.to_string())
        })?);
        send(&mut ws, &join_msg).await?;

        let reply = wait_for_reply(&mut ws, &device_channel.join_ref, Duration::from_secs(30)).await?;
        if !reply.reply_ok() {
            return Err(ChannelError::JoinRejected {
                topic: device_topic,
                reason: reply.reply_reason().unwrap_or("unknown").to_string(),
            });
        }
        info!("joined device channel");
        self.set_join_interface(&host).await;

        if !self.policy.firmware_validated() {
            info!("firmware not yet validated, confirming to the server");
            send(&mut ws, &device_channel.push("firmware_validated", json!({}))).await?;
        }

        let mut console_channel = None;
        if self.config.remote_shell_enabled {
            let channel = ChannelBuilder::new("console".to_string(), "2".to_string());
            send(&mut ws, &channel.join(json!({}))).await?;
            let reply = wait_for_reply(&mut ws, &channel.join_ref, Duration::from_secs(30)).await?;
            if reply.reply_ok() {
                console_channel = Some(channel);
            } else {
                warn!("console channel join rejected");
            }
        }

        let extensions_channel = ChannelBuilder::new("extensions".to_string(), "3".to_string());
        send(&mut ws, &extensions_channel.join(json!({ "extensions": self.extensions.allow_list() }))).await?;
        let _ = wait_for_reply(&mut ws, &extensions_channel.join_ref, Duration::from_secs(30)).await;

        self.alarms.clear(Alarm::Disconnected);

        self.event_loop(ws, host, device_channel, console_channel, extensions_channel).await
    }

    async fn event_loop(
        self: &Arc<Self>,
        mut ws: WsStream,
        host: String,
        device_channel: ChannelBuilder,
        console_channel: Option<ChannelBuilder>,
        extensions_channel: ChannelBuilder,
    ) -> ChannelResult<()> {
        let mut next_heartbeat = tokio::time::Instant::now() + self.config.heartbeat_interval;

        loop {
            let idle_deadline = if self.shell.lock().await.is_some() {
                Some(tokio::time::Instant::now() + self.config.remote_shell_idle_timeout)
            } else {
                None
            };

            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match Message::from_json(&text) {
                                Ok(msg) => self.dispatch(&mut ws, msg, &device_channel, console_channel.as_ref(), &extensions_channel).await?,
                                Err(err) => warn!(%err, "failed to parse inbound message"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(ChannelError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(ChannelError::WebSocket(err.to_string())),
                    }
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    send(&mut ws, &device_channel.heartbeat()).await?;
                    self.check_network_interface(&mut ws, &host, &device_channel).await?;
                    next_heartbeat = tokio::time::Instant::now() + self.config.heartbeat_interval;
                }
                _ = async { tokio::time::sleep_until(idle_deadline.unwrap()).await }, if idle_deadline.is_some() => {
                    if let Some(mut shell) = self.shell.lock().await.take() {
                        shell.terminate().await;
                        if let Some(console) = &console_channel {
                            let _ = send(&mut ws, &console.push("up", json!({"data": "\r\nsession timed out\r\n"}))).await;
                        }
                    }
                }
                output = async { self.console_out_rx.lock().await.recv().await } => {
                    if let (Some(data), Some(console)) = (output, &console_channel) {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        send(&mut ws, &console.push("up", json!({"data": text}))).await?;
                    }
                }
                status = async { self.status_rx.lock().await.recv().await } => {
                    if let Some(status) = status {
                        let payload = serde_json::to_value(&status).unwrap_or(json!({}));
                        send(&mut ws, &device_channel.push("status_update", payload)).await?;
                    }
                }
                progress = async { self.progress_rx.lock().await.recv().await } => {
                    if let Some(progress) = progress {
                        let payload = serde_json::to_value(&progress).unwrap_or(json!({}));
                        send(&mut ws, &device_channel.push("fwup_progress", payload)).await?;
                    }
                }
                upload = async { self.upload_rx.lock().await.recv().await } => {
                    if let (Some(frame), Some(console)) = (upload, &console_channel) {
                        match frame {
                            UploadFrame::Start { filename } => {
                                send(&mut ws, &console.push("file-data/start", json!({"filename": filename}))).await?;
                            }
                            UploadFrame::Chunk { filename, chunk } => {
                                let payload = json!({
                                    "filename": filename,
                                    "chunk": chunk.chunk,
                                    "data": chunk.data_base64,
                                });
                                send(&mut ws, &console.push("file-data", payload)).await?;
                            }
                            UploadFrame::Stop { filename } => {
                                send(&mut ws, &console.push("file-data/stop", json!({"filename": filename}))).await?;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        ws: &mut WsStream,
        msg: Message,
        device_channel: &ChannelBuilder,
        console_channel: Option<&ChannelBuilder>,
        extensions_channel: &ChannelBuilder,
    ) -> ChannelResult<()> {
        if msg.topic == device_channel.topic {
            self.handle_device_event(ws, msg, device_channel).await?;
        } else if Some(msg.topic.as_str()) == console_channel.map(|c| c.topic.as_str()) {
            self.handle_console_event(ws, msg, console_channel.unwrap()).await?;
        } else if msg.topic == extensions_channel.topic {
            self.handle_extensions_event(ws, msg, extensions_channel).await?;
        } else {
            debug!(topic = %msg.topic, event = %msg.event, "message for unknown topic ignored");
        }
        Ok(())
    }

    async fn handle_device_event(
        self: &Arc<Self>,
        ws: &mut WsStream,
        msg: Message,
        channel: &ChannelBuilder,
    ) -> ChannelResult<()> {
        match msg.event.as_str() {
            "update" => {
                let update: UpdateInfo = serde_json::from_value(msg.payload)
                    .map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
                let keys = self.fwup_keys.lock().await.clone();
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = this.update_manager.apply_update(update, keys).await {
                        warn!(%err, "update application failed");
                    }
                });
            }
            "archive" => {
                let archive: ArchiveInfo = serde_json::from_value(msg.payload)
                    .map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
                let keys = self.archive_keys.lock().await.clone();
                let manager = Arc::clone(&self.archive_manager);
                tokio::spawn(async move {
                    if let Err(err) = manager.apply_archive(archive, keys).await {
                        warn!(%err, "archive application failed");
                    }
                });
            }
            "reboot" => {
                send(ws, &channel.push("rebooting", json!({}))).await?;
                self.policy.reboot().await;
            }
            "identify" => {
                self.policy.identify().await;
            }
            "fwup_public_keys" => {
                let keys: Vec<PublicKey> = serde_json::from_value(msg.payload)
                    .map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
                *self.fwup_keys.lock().await = PublicKeySet(keys);
            }
            "archive_public_keys" => {
                let keys: Vec<PublicKey> = serde_json::from_value(msg.payload)
                    .map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
                *self.archive_keys.lock().await = PublicKeySet(keys);
            }
            "scripts/run" => {
                let text = msg.payload.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let timeout_ms = msg.payload.get("timeout_ms").and_then(|v| v.as_u64());
                let reply_ref = msg.msg_ref.clone();
                let outcome = script_runner::run(&text, timeout_ms).await;
                let mut payload = serde_json::to_value(&outcome).map_err(|e| ChannelError::MessageParsing(e.to_string()))?;
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("ref".to_string(), json!(reply_ref));
                }
                send(ws, &channel.push("scripts/run", payload)).await?;
            }
            "extensions:get" => {
                let known = self.extensions.known().await;
                send(ws, &channel.push("extensions:get", serde_json::to_value(known).unwrap_or(json!([])))).await?;
            }
            other => {
                debug!(event = other, "unhandled device event");
            }
        }
        Ok(())
    }

    async fn handle_console_event(
        self: &Arc<Self>,
        ws: &mut WsStream,
        msg: Message,
        channel: &ChannelBuilder,
    ) -> ChannelResult<()> {
        match msg.event.as_str() {
            "dn" => {
                let data = msg.payload.get("data").and_then(|v| v.as_str()).unwrap_or_default();
                let mut shell_slot = self.shell.lock().await;
                if shell_slot.is_none() {
                    *shell_slot = Some(RemoteShell::spawn(
                        self.config.remote_shell_idle_timeout,
                        self.console_out_tx.clone(),
                    )?);
                }
                if let Some(shell) = shell_slot.as_mut() {
                    shell.write(data.as_bytes()).await?;
                }
            }
            "restart" => {
                if let Some(mut shell) = self.shell.lock().await.take() {
                    shell.terminate().await;
                }
                *self.shell.lock().await = Some(RemoteShell::spawn(
                    self.config.remote_shell_idle_timeout,
                    self.console_out_tx.clone(),
                )?);
            }
            "window_size" => {
                debug!("window_size resize requested (no-op: plain pipe, not a real pty)");
            }
            "file-data/start" => {
                let filename = msg.payload.get("filename").and_then(|v| v.as_str()).unwrap_or("upload.bin");
                let path = self.config.data_dir.join(filename);
                let mut downloader = Downloader::new(path);
                downloader.start().await?;
                *self.file_download.lock().await = Some(downloader);
            }
            "file-data" => {
                let data = msg.payload.get("data").and_then(|v| v.as_str()).unwrap_or_default();
                let mut slot = self.file_download.lock().await;
                if let Some(downloader) = slot.as_mut() {
                    downloader.append(data).await?;
                } else {
                    warn!("file-data frame with no active transfer");
                }
            }
            "file-data/stop" => {
                if let Some(mut downloader) = self.file_download.lock().await.take() {
                    downloader.stop().await?;
                } else {
                    warn!("file-data/stop with no active transfer");
                }
            }
            other => {
                debug!(event = other, "unhandled console event");
            }
        }
        let _ = channel;
        let _ = ws;
        Ok(())
    }

    async fn handle_extensions_event(
        self: &Arc<Self>,
        ws: &mut WsStream,
        msg: Message,
        channel: &ChannelBuilder,
    ) -> ChannelResult<()> {
        let Some((name, event)) = msg.event.split_once(':') else {
            debug!(event = %msg.event, "malformed extensions event");
            return Ok(());
        };

        match event {
            "attach" => {
                let version = msg.payload.get("version").and_then(|v| v.as_str()).unwrap_or("0.0.0");
                match self.extensions.attach(name, version).await {
                    Ok(()) => send(ws, &channel.push(&format!("{name}:attached"), json!({}))).await?,
                    Err(err) => send(ws, &channel.push(&format!("{name}:error"), json!({"reason": err.to_string()}))).await?,
                }
            }
            "detach" => {
                match self.extensions.detach(name).await {
                    Ok(()) => send(ws, &channel.push(&format!("{name}:detached"), json!({}))).await?,
                    Err(err) => send(ws, &channel.push(&format!("{name}:error"), json!({"reason": err.to_string()}))).await?,
                }
            }
            other => {
                let _ = self.extensions.route(name, other).await;
            }
        }
        Ok(())
    }

    async fn device_join_params(&self) -> DeviceJoinParams {
        let slot = self
            .slot_store
            .snapshot()
            .await
            .unwrap_or_default();
        DeviceJoinParams {
            firmware_validated: self.policy.firmware_validated(),
            currently_downloading_uuid: None,
            slot,
        }
    }

    async fn wait_for_network(&self) {
        let host = self.config.server_url.clone();
        loop {
            if let Ok(uri) = host.parse::<tungstenite::http::Uri>() {
                if let Some(authority) = uri.authority() {
                    let host = authority.host();
                    let port = authority.port_u16().unwrap_or(443);
                    if TcpStream::connect((host, port)).await.is_ok() {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }

    async fn connect(&self, host: &str) -> ChannelResult<WsStream> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let device_id = self
            .slot_store
            .snapshot()
            .await
            .ok()
            .and_then(|s| s.nerves_fw_uuid)
            .unwrap_or_else(|| "unknown-device".to_string());

        let connect_auth = auth::resolve(&self.config.auth, &device_id, now)?;
        let request = auth::build_request(&self.config.server_url, host, &connect_auth)?;

        let connector = match &connect_auth {
            ConnectAuth::MutualTls(tls) | ConnectAuth::SharedSecret(tls, _) => {
                tokio_tungstenite::Connector::Rustls(Arc::new(tls.clone()))
            }
        };

        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            Some(connector),
        )
        .await
        .map_err(|e| ChannelError::Connection(e.to_string()))?;

        Ok(ws)
    }

    /// Records the interface observed at join as the baseline `expected`
    /// interface for this connection's lifetime.
    async fn set_join_interface(&self, host: &str) {
        if let Ok(current) = self.network.current_interface(host).await {
            *self.last_reported_interface.lock().await = Some(current);
        }
    }

    /// Compares the currently observed interface against the one recorded
    /// at join and, on divergence, pushes `network_interface_mismatch` on
    /// the device channel per catalog 6 and notifies the policy.
    async fn check_network_interface(
        &self,
        ws: &mut WsStream,
        host: &str,
        device_channel: &ChannelBuilder,
    ) -> ChannelResult<()> {
        let Ok(current) = self.network.current_interface(host).await else {
            return Ok(());
        };
        let mut last = self.last_reported_interface.lock().await;
        if let Some(expected) = last.clone() {
            if expected != current {
                warn!(?expected, ?current, "network interface changed mid-connection");
                let payload = json!({ "expected": expected, "current": current });
                send(ws, &device_channel.push("network_interface_mismatch", payload)).await?;
                self.policy.network_interface_changed(&expected, &current).await;
                *last = Some(current);
            }
        }
        Ok(())
    }
}

async fn send(ws: &mut WsStream, msg: &Message) -> ChannelResult<()> {
    ws.send(WsMessage::Text(msg.to_json().into()))
        .await
        .map_err(|e| ChannelError::WebSocket(e.to_string()))
}

async fn wait_for_reply(ws: &mut WsStream, join_ref: &str, timeout: Duration) -> ChannelResult<Message> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            frame = ws.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(msg) = Message::from_json(&text) {
                            if msg.is_reply() && msg.msg_ref.as_deref() == Some(join_ref) {
                                return Ok(msg);
                            }
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(ChannelError::WebSocket(err.to_string())),
                    None => return Err(ChannelError::Closed),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ChannelError::Timeout(format!("join reply for ref {join_ref}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_event_splits_name_and_event() {
        let event = "geo:attach";
        let (name, ev) = event.split_once(':').unwrap();
        assert_eq!(name, "geo");
        assert_eq!(ev, "attach");
    }
}
