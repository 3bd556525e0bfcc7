//! Loopback stream origin
//!
//! Serves [`SyntheticStream`]s to players: answers play requests on a
//! WebSocket signaling endpoint, answers UDP binding checks and then paces
//! RTP over UDP or interleaved on the signaling socket.

use crate::source::{SyntheticStream, AUDIO_PAYLOAD_TYPE, AUDIO_SSRC, VIDEO_PAYLOAD_TYPE, VIDEO_SSRC};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rtplayer_core::signaling::{binding_datagram, parse_binding, BINDING_REQUEST, BINDING_RESPONSE};
use rtplayer_core::{
    NtpTimestamp, PlayAnswer, PlayOffer, PlayerError, PlayerResult, RtpPacketizer,
    SignalingMessage, SignalingResponse, TrackKind, TransportMode,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error code sent when a play request arrives on a plain connection that must be secure
pub const TLS_REQUIRED: &str = "TLS_REQUIRED";

/// Outbound signaling messages queued per connection
const OUTBOUND_QUEUE: usize = 512;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// How the origin treats plain (non-TLS) signaling connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Serve plain connections
    #[default]
    Optional,
    /// Refuse the WebSocket upgrade with HTTP 426
    RejectUpgrade,
    /// Accept the upgrade but answer play requests with `TLS_REQUIRED`
    RejectPlay,
}

/// Origin configuration
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Signaling listen address
    pub bind_addr: SocketAddr,
    /// Media socket address (also the advertised UDP candidate)
    pub media_bind_addr: SocketAddr,
    /// Treatment of plain connections
    pub tls_policy: TlsPolicy,
    /// Advertise the UDP candidate in answers
    pub offer_udp: bool,
    /// Reply to binding requests; when false, clients fall back to interleaved
    pub answer_bindings: bool,
    /// Largest RTP packet sent
    pub mtu: usize,
    /// HTTP path of the signaling endpoint
    pub signaling_path: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            media_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tls_policy: TlsPolicy::Optional,
            offer_udp: true,
            answer_bindings: true,
            mtu: 1200,
            signaling_path: "/rtc/v1/play".to_string(),
        }
    }
}

/// What the origin knows about one playing client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Origin-assigned session id
    pub session_id: String,
    /// Stream being played
    pub stream: String,
    /// Client identifier from the offer
    pub client_id: String,
    /// Transport in use once media flows
    pub mode: Option<TransportMode>,
    /// Tracks the client asked to pause
    pub disabled_tracks: Vec<TrackKind>,
}

struct Shared {
    config: OriginConfig,
    signaling_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    streams: DashMap<String, SyntheticStream>,
    sessions: DashMap<String, SessionInfo>,
    /// Binding token -> client media address once checked
    bindings: DashMap<u64, Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl Shared {
    fn publish(&self, path: &str, stream: SyntheticStream) {
        info!("Publishing stream {}", path);
        self.streams.insert(normalize(path), stream);
    }

    fn play_url(&self, path: &str) -> String {
        format!("webrtc://{}/{}", self.signaling_addr, normalize(path))
    }
}

/// A bound, not yet running origin
pub struct StreamOrigin {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl StreamOrigin {
    /// Bind the signaling listener and the media socket
    pub async fn bind(config: OriginConfig) -> PlayerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| PlayerError::Initialization {
                reason: format!("cannot bind signaling on {}: {}", config.bind_addr, e),
            })?;
        let udp = UdpSocket::bind(config.media_bind_addr)
            .await
            .map_err(|e| PlayerError::Initialization {
                reason: format!("cannot bind media on {}: {}", config.media_bind_addr, e),
            })?;
        let signaling_addr = listener.local_addr().map_err(|e| PlayerError::Initialization {
            reason: e.to_string(),
        })?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                signaling_addr,
                udp: Arc::new(udp),
                streams: DashMap::new(),
                sessions: DashMap::new(),
                bindings: DashMap::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Signaling address
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.signaling_addr
    }

    /// Make a stream available under `path`
    pub fn publish(&self, path: &str, stream: SyntheticStream) {
        self.shared.publish(path, stream);
    }

    /// Start serving
    pub fn spawn(self) -> OriginHandle {
        info!("Stream origin listening on {}", self.shared.signaling_addr);
        let accept = tokio::spawn(accept_loop(self.listener, self.shared.clone()));
        let bindings = tokio::spawn(answer_bindings(self.shared.clone()));
        OriginHandle {
            shared: self.shared,
            tasks: vec![accept, bindings],
        }
    }
}

/// Handle to a running origin; dropping it shuts the origin down
pub struct OriginHandle {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl OriginHandle {
    /// Signaling address
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.signaling_addr
    }

    /// Media socket address
    pub fn media_addr(&self) -> PlayerResult<SocketAddr> {
        self.shared.udp.local_addr().map_err(|e| PlayerError::Initialization {
            reason: e.to_string(),
        })
    }

    /// Play URL for a published path
    pub fn play_url(&self, path: &str) -> String {
        self.shared.play_url(path)
    }

    /// Make a stream available under `path`
    pub fn publish(&self, path: &str, stream: SyntheticStream) {
        self.shared.publish(path, stream);
    }

    /// Withdraw a stream; running sessions keep playing
    pub fn unpublish(&self, path: &str) -> bool {
        self.shared.streams.remove(&normalize(path)).is_some()
    }

    /// Number of connected play sessions
    pub fn active_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Snapshot of every play session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stop accepting, close every connection and wait for the origin tasks
    pub async fn shutdown(mut self) {
        self.shared.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        info!("Stream origin stopped");
    }
}

impl Drop for OriginHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    debug!("New connection from {}", peer);
                    tokio::spawn(serve_connection(shared.clone(), tcp, peer));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
        }
    }
}

async fn answer_bindings(shared: Arc<Shared>) {
    let mut buf = [0u8; 64];
    loop {
        let received = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            received = shared.udp.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Media socket receive error: {}", e);
                continue;
            }
        };
        let Some(token) = parse_binding(BINDING_REQUEST, &buf[..len]) else {
            debug!("Ignoring {} byte datagram from {}", len, from);
            continue;
        };

        match shared.bindings.get_mut(&token) {
            Some(mut entry) if shared.config.answer_bindings => *entry = Some(from),
            Some(_) => {
                debug!("Not answering binding request from {}", from);
                continue;
            }
            None => {
                debug!("Binding request with unknown token from {}", from);
                continue;
            }
        }
        let response = binding_datagram(BINDING_RESPONSE, token);
        if let Err(e) = shared.udp.send_to(&response, from).await {
            warn!("Failed to answer binding request from {}: {}", from, e);
        }
    }
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn serve_connection(shared: Arc<Shared>, tcp: TcpStream, peer: SocketAddr) {
    let policy = shared.config.tls_policy;
    let path = shared.config.signaling_path.clone();
    let check = move |request: &Request, response: Response| {
        if policy == TlsPolicy::RejectUpgrade {
            return Err(error_response(StatusCode::UPGRADE_REQUIRED, "TLS required"));
        }
        if request.uri().path() != path {
            return Err(error_response(StatusCode::NOT_FOUND, "unknown endpoint"));
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(tcp, check).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} refused: {}", peer, e);
            return;
        }
    };

    let (sink, source) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let mut connection = Connection {
        shared,
        out: out_tx,
        session: None,
    };
    connection.run(source).await;
    connection.teardown().await;
    drop(connection);

    let _ = writer.await;
    debug!("Connection from {} closed", peer);
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!("Signaling write failed: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
}

struct ActiveSession {
    id: String,
    token: u64,
    stream: SyntheticStream,
    switches: Arc<TrackSwitches>,
    sender: Option<(CancellationToken, JoinHandle<()>)>,
}

struct Connection {
    shared: Arc<Shared>,
    out: mpsc::Sender<Message>,
    session: Option<ActiveSession>,
}

impl Connection {
    async fn run(&mut self, mut source: WsSource) {
        let cancel = self.shared.cancel.clone();
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = source.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(message) => {
                        if !self.handle(message).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        let reason = format!("invalid message: {}", e);
                        self.reject(&PlayerError::Protocol { reason: reason.clone() }, &reason)
                            .await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    return;
                }
            }
        }
    }

    /// Returns false when the connection should end
    async fn handle(&mut self, message: SignalingMessage) -> bool {
        match message {
            SignalingMessage::Play(offer) => self.handle_play(offer).await,
            SignalingMessage::TransportReady { mode } => self.handle_transport_ready(mode).await,
            SignalingMessage::TrackControl { kind, enabled } => {
                if let Some(session) = &self.session {
                    session.switches.set(kind, enabled);
                    if let Some(mut info) = self.shared.sessions.get_mut(&session.id) {
                        info.disabled_tracks.retain(|k| *k != kind);
                        if !enabled {
                            info.disabled_tracks.push(kind);
                        }
                    }
                    info!("Session {}: {} track {}", session.id, kind, if enabled { "enabled" } else { "disabled" });
                }
            }
            SignalingMessage::Ping => self.respond(&SignalingResponse::Pong).await,
            SignalingMessage::Stop => {
                debug!("Client sent stop");
                return false;
            }
        }
        true
    }

    async fn handle_play(&mut self, offer: PlayOffer) {
        if self.session.is_some() {
            let reason = "session already active".to_string();
            self.reject(&PlayerError::Protocol { reason: reason.clone() }, &reason).await;
            return;
        }
        if self.shared.config.tls_policy == TlsPolicy::RejectPlay {
            self.respond(&SignalingResponse::Error {
                error: "secure signaling required".to_string(),
                error_code: TLS_REQUIRED.to_string(),
            })
            .await;
            return;
        }

        let path = normalize(&offer.stream);
        let Some(stream) = self.shared.streams.get(&path).map(|s| s.value().clone()) else {
            info!("Play request for unknown stream {}", path);
            self.reject(&PlayerError::StreamNotFound { stream: path.clone() }, &path)
                .await;
            return;
        };
        if let Some(codec) = stream
            .codecs()
            .into_iter()
            .find(|codec| !offer.codecs.iter().any(|c| c.eq_ignore_ascii_case(codec)))
        {
            self.reject(&PlayerError::UnsupportedCodec { codec: codec.clone() }, &codec)
                .await;
            return;
        }

        let session_id = Uuid::new_v4().to_string();
        let token: u64 = rand::random();
        self.shared.bindings.insert(token, None);
        let candidates = if self.shared.config.offer_udp && offer.transports.contains(&TransportMode::Udp) {
            self.shared.udp.local_addr().map(|addr| vec![addr]).unwrap_or_default()
        } else {
            Vec::new()
        };

        let answer = PlayAnswer {
            session_id: session_id.clone(),
            tracks: stream.answered_tracks(),
            candidates,
            binding_token: token,
        };
        self.shared.sessions.insert(
            session_id.clone(),
            SessionInfo {
                session_id: session_id.clone(),
                stream: path.clone(),
                client_id: offer.client_id,
                mode: None,
                disabled_tracks: Vec::new(),
            },
        );
        self.session = Some(ActiveSession {
            id: session_id.clone(),
            token,
            stream,
            switches: Arc::new(TrackSwitches::default()),
            sender: None,
        });

        info!("Session {} plays {}", session_id, path);
        self.respond(&SignalingResponse::Answer(answer)).await;
    }

    async fn handle_transport_ready(&mut self, mode: TransportMode) {
        let Some(session) = self.session.as_mut() else {
            let reason = "transport ready without a session".to_string();
            self.reject(&PlayerError::Protocol { reason: reason.clone() }, &reason).await;
            return;
        };
        if session.sender.is_some() {
            return;
        }

        let output = match mode {
            TransportMode::Udp => {
                let peer = self.shared.bindings.get(&session.token).and_then(|entry| *entry);
                match peer {
                    Some(peer) => MediaOutput::Udp {
                        socket: self.shared.udp.clone(),
                        peer,
                    },
                    None => {
                        let reason = "UDP selected without a completed binding".to_string();
                        self.reject(&PlayerError::Protocol { reason: reason.clone() }, &reason)
                            .await;
                        return;
                    }
                }
            }
            TransportMode::Interleaved => MediaOutput::Interleaved(self.out.clone()),
        };

        if let Some(mut info) = self.shared.sessions.get_mut(&session.id) {
            info.mode = Some(mode);
        }
        info!("Session {} sending over {:?}", session.id, mode);

        let cancel = self.shared.cancel.child_token();
        let task = tokio::spawn(send_media(
            session.stream.clone(),
            output,
            self.out.clone(),
            session.switches.clone(),
            cancel.clone(),
            self.shared.config.mtu,
        ));
        session.sender = Some((cancel, task));
    }

    async fn respond(&self, response: &SignalingResponse) {
        match serde_json::to_string(response) {
            Ok(json) => {
                if self.out.send(Message::Text(json)).await.is_err() {
                    debug!("Connection writer gone");
                }
            }
            Err(e) => error!("Failed to serialize response: {}", e),
        }
    }

    async fn reject(&self, error: &PlayerError, message: &str) {
        self.respond(&SignalingResponse::Error {
            error: message.to_string(),
            error_code: error.error_code(),
        })
        .await;
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some((cancel, task)) = session.sender {
                cancel.cancel();
                let _ = task.await;
            }
            self.shared.bindings.remove(&session.token);
            self.shared.sessions.remove(&session.id);
            info!("Session {} ended", session.id);
        }
    }
}

/// Per-session track enable flags driven by `TrackControl`
#[derive(Debug)]
struct TrackSwitches {
    audio: AtomicBool,
    video: AtomicBool,
}

impl Default for TrackSwitches {
    fn default() -> Self {
        Self {
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
        }
    }
}

impl TrackSwitches {
    fn flag(&self, kind: TrackKind) -> &AtomicBool {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    fn set(&self, kind: TrackKind, enabled: bool) {
        self.flag(kind).store(enabled, Ordering::Relaxed);
    }

    fn enabled(&self, kind: TrackKind) -> bool {
        self.flag(kind).load(Ordering::Relaxed)
    }
}

enum MediaOutput {
    Udp { socket: Arc<UdpSocket>, peer: SocketAddr },
    Interleaved(mpsc::Sender<Message>),
}

impl MediaOutput {
    /// Returns false once the receiver is gone
    async fn send(&self, data: Bytes) -> bool {
        match self {
            MediaOutput::Udp { socket, peer } => {
                if let Err(e) = socket.send_to(&data, peer).await {
                    debug!("Media send to {} failed: {}", peer, e);
                }
                true
            }
            MediaOutput::Interleaved(tx) => tx.send(Message::Binary(data.to_vec())).await.is_ok(),
        }
    }
}

struct TrackSender {
    packetizer: RtpPacketizer,
    base_timestamp: u32,
    ticks_per_frame: u32,
    frames: u64,
}

impl TrackSender {
    fn new(payload_type: u8, ssrc: u32, ticks_per_frame: u32, mtu: usize) -> Self {
        Self {
            packetizer: RtpPacketizer::new(payload_type, ssrc, rand::random(), mtu),
            base_timestamp: rand::random(),
            ticks_per_frame,
            frames: 0,
        }
    }

    fn timestamp(&self) -> u32 {
        self.base_timestamp
            .wrapping_add((self.frames as u32).wrapping_mul(self.ticks_per_frame))
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_packets(output: &MediaOutput, sender: &mut TrackSender, frame: &[u8]) -> bool {
    let timestamp = sender.timestamp();
    sender.frames += 1;
    for packet in sender.packetizer.packetize(timestamp, frame) {
        if !output.send(packet.to_bytes()).await {
            return false;
        }
    }
    true
}

async fn send_media(
    stream: SyntheticStream,
    output: MediaOutput,
    signals: mpsc::Sender<Message>,
    switches: Arc<TrackSwitches>,
    cancel: CancellationToken,
    mtu: usize,
) {
    let start = Instant::now();
    let ntp = NtpTimestamp::now();

    let mut audio = stream.audio.as_ref().map(|source| {
        TrackSender::new(AUDIO_PAYLOAD_TYPE, AUDIO_SSRC, source.samples_per_frame(), mtu)
    });
    let mut video = stream.video.as_ref().map(|source| {
        TrackSender::new(VIDEO_PAYLOAD_TYPE, VIDEO_SSRC, 90_000 / source.fps.max(1), mtu)
    });

    // Sender reports first so the player can align the tracks
    for sender in [audio.as_ref(), video.as_ref()].into_iter().flatten() {
        let report = sender.packetizer.sender_report(ntp, sender.base_timestamp);
        if !output.send(report.to_bytes()).await {
            return;
        }
    }

    let mut audio_ticker = stream
        .audio
        .as_ref()
        .map(|source| tokio::time::interval_at(start, source.frame_duration));
    let mut video_ticker = stream
        .video
        .as_ref()
        .map(|source| tokio::time::interval_at(start, source.frame_interval()));
    let end = stream.duration.map(|d| start + d);
    let mut video_announced = !stream.announce_video_late;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick(&mut audio_ticker) => {
                if let (Some(source), Some(sender)) = (&stream.audio, audio.as_mut()) {
                    let frame = source.frame(sender.frames);
                    if !switches.enabled(TrackKind::Audio) {
                        sender.frames += 1;
                    } else if !send_packets(&output, sender, &frame).await {
                        return;
                    }
                }
            }
            _ = tick(&mut video_ticker) => {
                if let (Some(source), Some(sender)) = (&stream.video, video.as_mut()) {
                    let frame = source.frame(sender.frames);
                    if !switches.enabled(TrackKind::Video) {
                        sender.frames += 1;
                        continue;
                    }
                    if !send_packets(&output, sender, &frame).await {
                        return;
                    }
                    if !video_announced {
                        video_announced = true;
                        if let Some(track) = stream.track(TrackKind::Video) {
                            send_signal(&signals, &SignalingResponse::TrackAnnounced(track)).await;
                        }
                    }
                }
            }
            _ = sleep_until(end) => {
                info!("Stream finished after {:?}", start.elapsed());
                send_signal(&signals, &SignalingResponse::EndOfStream).await;
                return;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_signal(signals: &mpsc::Sender<Message>, response: &SignalingResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            let _ = signals.send(Message::Text(json)).await;
        }
        Err(e) => error!("Failed to serialize response: {}", e),
    }
}
