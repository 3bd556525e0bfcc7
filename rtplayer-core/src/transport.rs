//! Session negotiation and the live media transport
//!
//! A play session is negotiated over a WebSocket signaling connection. Media
//! then flows either over a UDP socket validated by a binding check or, when
//! that fails, interleaved on the signaling socket itself.

use crate::error::{PlayerError, PlayerResult};
use crate::rtp::InboundPacket;
use crate::signaling::{
    binding_datagram, parse_binding, PlayAnswer, PlayOffer, SignalingMessage, SignalingResponse,
    TransportMode, BINDING_REQUEST, BINDING_RESPONSE,
};
use crate::track::{codec_names, TrackDescription};
use crate::url::PlayUrl;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type SignalingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest datagram the media socket accepts
const MAX_DATAGRAM: usize = 64 * 1024;

/// Negotiation and transport configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on host name resolution
    pub dns_timeout: Duration,
    /// Bound on the TCP connect to the signaling endpoint
    pub connect_timeout: Duration,
    /// Bound on the WebSocket (and TLS) handshake
    pub handshake_timeout: Duration,
    /// Bound on waiting for the origin's answer
    pub answer_timeout: Duration,
    /// Total time spent on the UDP connectivity check
    pub binding_timeout: Duration,
    /// Binding requests sent per candidate within `binding_timeout`
    pub binding_attempts: u32,
    /// Keepalive interval on the signaling connection
    pub keep_alive_interval: Duration,
    /// Time without any media before the transport is considered dead
    pub media_timeout: Duration,
    /// Transport modes in order of preference (the fallback chain)
    pub preferred_transports: Vec<TransportMode>,
    /// Signaling port when the URL has none and TLS is off
    pub default_port: u16,
    /// Signaling port when the URL has none and TLS is on
    pub default_tls_port: u16,
    /// HTTP path of the signaling endpoint
    pub signaling_path: String,
    /// Receive buffer requested for the UDP media socket
    pub udp_recv_buffer: usize,
    /// Codec names offered to the origin
    pub offered_codecs: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dns_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            answer_timeout: Duration::from_secs(10),
            binding_timeout: Duration::from_secs(2),
            binding_attempts: 4,
            keep_alive_interval: Duration::from_secs(15),
            media_timeout: Duration::from_secs(10),
            preferred_transports: vec![TransportMode::Udp, TransportMode::Interleaved],
            default_port: 1985,
            default_tls_port: 443,
            signaling_path: "/rtc/v1/play".to_string(),
            udp_recv_buffer: 2 * 1024 * 1024,
            offered_codecs: vec![codec_names::L16.to_string(), codec_names::RAW_I420.to_string()],
        }
    }
}

impl ConnectionConfig {
    /// Short timeouts for local networks
    pub fn low_latency() -> Self {
        Self {
            dns_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(4),
            answer_timeout: Duration::from_secs(4),
            binding_timeout: Duration::from_millis(800),
            media_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Generous timeouts for lossy or distant networks
    pub fn resilient() -> Self {
        Self {
            dns_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            answer_timeout: Duration::from_secs(20),
            binding_timeout: Duration::from_secs(4),
            binding_attempts: 8,
            media_timeout: Duration::from_secs(20),
            udp_recv_buffer: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Something the live transport produced
#[derive(Debug)]
pub enum TransportEvent {
    /// RTP or RTCP from the origin
    Packet(InboundPacket),
    /// A signaling message from the origin
    Signal(SignalingResponse),
    /// The origin closed the signaling connection
    Closed,
}

enum Step {
    Datagram(Bytes),
    Event(TransportEvent),
    Closed(Option<PlayerError>),
    Skip,
}

/// Establishes play sessions
#[derive(Debug, Clone)]
pub struct SessionNegotiator {
    config: ConnectionConfig,
    client_id: String,
}

impl SessionNegotiator {
    /// Create a negotiator with the given configuration
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            client_id: Uuid::new_v4().to_string(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Negotiate a session and return the live transport
    ///
    /// Failures are reported once and never retried here.
    pub async fn connect(
        &self,
        url: &PlayUrl,
        support_https: bool,
    ) -> PlayerResult<TransportConnection> {
        let port = url.signaling_port(
            support_https,
            self.config.default_port,
            self.config.default_tls_port,
        );
        let endpoint = url.signaling_url(support_https, port, &self.config.signaling_path);
        info!("Negotiating {} via {}", url, endpoint);

        let remote = self.resolve(url.host(), port).await?;
        let tcp = self.connect_tcp(&remote, &endpoint).await?;
        let peer = tcp.peer_addr().unwrap_or(remote[0]);
        let mut ws = self.handshake(tcp, &endpoint, support_https).await?;

        let answer = self.exchange_offer(&mut ws, url, &endpoint).await?;
        info!(
            "Origin answered session {} with {} track(s)",
            answer.session_id,
            answer.tracks.len()
        );

        let (mode, udp) = self.select_transport(&answer).await?;
        send_message(&mut ws, &SignalingMessage::TransportReady { mode }, &endpoint).await?;
        info!("Transport ready using {:?}", mode);

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keep_alive_interval,
            self.config.keep_alive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(TransportConnection {
            ws,
            udp,
            mode,
            endpoint,
            remote: peer,
            session_id: answer.session_id,
            tracks: answer.tracks,
            keepalive,
            media_timeout: self.config.media_timeout,
            last_media: Instant::now(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
            malformed_packets: 0,
            closed: false,
        })
    }

    async fn resolve(&self, host: &str, port: u16) -> PlayerResult<Vec<SocketAddr>> {
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let lookup = tokio::net::lookup_host((bare_host, port));
        let addrs: Vec<SocketAddr> = timeout(self.config.dns_timeout, lookup)
            .await
            .map_err(|_| PlayerError::DnsResolution {
                host: host.to_string(),
                reason: format!("timed out after {:?}", self.config.dns_timeout),
            })?
            .map_err(|e| PlayerError::DnsResolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(PlayerError::DnsResolution {
                host: host.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        debug!("Resolved {} to {:?}", host, addrs);
        Ok(addrs)
    }

    async fn connect_tcp(&self, addrs: &[SocketAddr], endpoint: &str) -> PlayerResult<TcpStream> {
        let mut last_error = None;
        for addr in addrs {
            match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    debug!("TCP connected to {}", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("TCP connect to {} failed: {}", addr, e);
                    last_error = Some(PlayerError::Connection {
                        endpoint: endpoint.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    debug!("TCP connect to {} timed out", addr);
                    last_error = Some(PlayerError::Timeout {
                        operation: format!("connect to {}", addr),
                        duration: self.config.connect_timeout,
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PlayerError::Connection {
            endpoint: endpoint.to_string(),
            reason: "no address to connect to".to_string(),
        }))
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        endpoint: &str,
        secure: bool,
    ) -> PlayerResult<SignalingStream> {
        if secure {
            let _ = rustls::crypto::CryptoProvider::install_default(
                rustls::crypto::aws_lc_rs::default_provider(),
            );
        }

        let upgrade = tokio_tungstenite::client_async_tls_with_config(endpoint, tcp, None, None);
        let (ws, response) = timeout(self.config.handshake_timeout, upgrade)
            .await
            .map_err(|_| PlayerError::Timeout {
                operation: "signaling handshake".to_string(),
                duration: self.config.handshake_timeout,
            })?
            .map_err(|e| map_handshake_error(e, endpoint, secure))?;

        debug!("Signaling upgraded with status {}", response.status());
        Ok(ws)
    }

    async fn exchange_offer(
        &self,
        ws: &mut SignalingStream,
        url: &PlayUrl,
        endpoint: &str,
    ) -> PlayerResult<PlayAnswer> {
        let offer = SignalingMessage::Play(PlayOffer {
            stream: url.stream_path().to_string(),
            client_id: self.client_id.clone(),
            transports: self.config.preferred_transports.clone(),
            codecs: self.config.offered_codecs.clone(),
        });
        send_message(ws, &offer, endpoint).await?;

        let wait = async {
            while let Some(message) = ws.next().await {
                let message = message.map_err(|e| PlayerError::Connection {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(frame) => {
                        return Err(PlayerError::TransportClosed {
                            reason: frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed before answer".to_string()),
                        });
                    }
                    _ => continue,
                };
                match serde_json::from_str::<SignalingResponse>(&text) {
                    Ok(SignalingResponse::Answer(answer)) => return Ok(answer),
                    Ok(SignalingResponse::Error { error, error_code }) => {
                        return Err(PlayerError::from_remote(&error_code, &error));
                    }
                    Ok(SignalingResponse::EndOfStream) => {
                        return Err(PlayerError::TransportClosed {
                            reason: "stream ended before answer".to_string(),
                        });
                    }
                    Ok(SignalingResponse::Pong) | Ok(SignalingResponse::TrackAnnounced(_)) => {}
                    Err(e) => {
                        return Err(PlayerError::Protocol {
                            reason: format!("malformed answer: {}", e),
                        });
                    }
                }
            }
            Err(PlayerError::TransportClosed {
                reason: "signaling closed before answer".to_string(),
            })
        };

        let answer = timeout(self.config.answer_timeout, wait)
            .await
            .map_err(|_| PlayerError::Timeout {
                operation: "play answer".to_string(),
                duration: self.config.answer_timeout,
            })??;

        validate_answer(&answer)?;
        Ok(answer)
    }

    /// Walk the fallback chain until a mode works
    async fn select_transport(
        &self,
        answer: &PlayAnswer,
    ) -> PlayerResult<(TransportMode, Option<UdpSocket>)> {
        for mode in &self.config.preferred_transports {
            debug!("Trying transport mode: {:?}", mode);
            match mode {
                TransportMode::Udp => match self.binding_check(answer).await {
                    Ok(socket) => return Ok((TransportMode::Udp, Some(socket))),
                    Err(e) => warn!("Transport {:?} failed: {}", mode, e),
                },
                TransportMode::Interleaved => return Ok((TransportMode::Interleaved, None)),
            }
        }

        Err(PlayerError::Connection {
            endpoint: answer.session_id.clone(),
            reason: "All transport modes failed".to_string(),
        })
    }

    async fn binding_check(&self, answer: &PlayAnswer) -> PlayerResult<UdpSocket> {
        let first = *answer.candidates.first().ok_or_else(|| PlayerError::Connection {
            endpoint: answer.session_id.clone(),
            reason: "origin offered no UDP candidates".to_string(),
        })?;
        let candidates: Vec<SocketAddr> = answer
            .candidates
            .iter()
            .copied()
            .filter(|c| c.is_ipv4() == first.is_ipv4())
            .collect();

        let socket = bind_media_socket(first, self.config.udp_recv_buffer).map_err(|e| {
            PlayerError::Connection {
                endpoint: first.to_string(),
                reason: format!("cannot open media socket: {}", e),
            }
        })?;

        let request = binding_datagram(BINDING_REQUEST, answer.binding_token);
        let attempts = self.config.binding_attempts.max(1);
        let per_attempt = self.config.binding_timeout / attempts;
        let mut buf = [0u8; 64];

        for attempt in 1..=attempts {
            for candidate in &candidates {
                if let Err(e) = socket.send_to(&request, candidate).await {
                    debug!("Binding request to {} failed: {}", candidate, e);
                }
            }

            let deadline = Instant::now() + per_attempt;
            loop {
                let recv = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
                let Ok(result) = recv else { break };
                let (len, from) = result.map_err(|e| PlayerError::Connection {
                    endpoint: first.to_string(),
                    reason: e.to_string(),
                })?;
                if parse_binding(BINDING_RESPONSE, &buf[..len]) == Some(answer.binding_token)
                    && candidates.contains(&from)
                {
                    socket.connect(from).await.map_err(|e| PlayerError::Connection {
                        endpoint: from.to_string(),
                        reason: e.to_string(),
                    })?;
                    info!("UDP binding succeeded with {} on attempt {}", from, attempt);
                    return Ok(socket);
                }
            }
        }

        Err(PlayerError::Timeout {
            operation: "UDP binding check".to_string(),
            duration: self.config.binding_timeout,
        })
    }
}

/// A negotiated, live media transport
#[derive(Debug)]
pub struct TransportConnection {
    ws: SignalingStream,
    udp: Option<UdpSocket>,
    mode: TransportMode,
    endpoint: String,
    remote: SocketAddr,
    session_id: String,
    tracks: Vec<TrackDescription>,
    keepalive: Interval,
    media_timeout: Duration,
    last_media: Instant,
    recv_buf: Vec<u8>,
    malformed_packets: u64,
    closed: bool,
}

impl TransportConnection {
    /// Wait for the next packet or signaling message
    ///
    /// Malformed datagrams are skipped and counted. Cancel safe.
    pub async fn next_event(&mut self) -> PlayerResult<TransportEvent> {
        if self.closed {
            return Ok(TransportEvent::Closed);
        }

        loop {
            let media_timeout = self.media_timeout;
            let media_deadline = self.last_media + media_timeout;
            let Self {
                ws,
                udp,
                keepalive,
                recv_buf,
                endpoint,
                ..
            } = self;

            let datagram = async {
                match udp {
                    Some(socket) => socket.recv(recv_buf).await.map(|len| recv_buf[..len].to_vec()),
                    None => std::future::pending().await,
                }
            };

            let step = tokio::select! {
                message = ws.next() => match message {
                    Some(Ok(Message::Binary(data))) => Step::Datagram(Bytes::from(data)),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingResponse>(&text) {
                            Ok(SignalingResponse::Pong) => Step::Skip,
                            Ok(response) => Step::Event(TransportEvent::Signal(response)),
                            Err(e) => {
                                warn!("Ignoring malformed signaling message: {}", e);
                                Step::Skip
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => Step::Closed(None),
                    Some(Ok(_)) => Step::Skip,
                    Some(Err(e)) => Step::Closed(Some(PlayerError::Connection {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    })),
                },
                received = datagram => match received {
                    Ok(data) => Step::Datagram(Bytes::from(data)),
                    Err(e) => {
                        // ICMP unreachable surfaces here on some platforms
                        debug!("Media socket receive error: {}", e);
                        Step::Skip
                    }
                },
                _ = keepalive.tick() => {
                    send_message(ws, &SignalingMessage::Ping, endpoint).await?;
                    Step::Skip
                }
                _ = tokio::time::sleep_until(media_deadline) => {
                    return Err(PlayerError::Connection {
                        endpoint: endpoint.clone(),
                        reason: format!("no media received for {:?}", media_timeout),
                    });
                }
            };

            match step {
                Step::Skip => continue,
                Step::Event(event) => return Ok(event),
                Step::Closed(error) => {
                    self.closed = true;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(TransportEvent::Closed),
                    };
                }
                Step::Datagram(raw) => {
                    self.last_media = Instant::now();
                    match InboundPacket::parse(raw) {
                        Ok(packet) => return Ok(TransportEvent::Packet(packet)),
                        Err(e) => {
                            self.malformed_packets += 1;
                            debug!("Dropping malformed datagram: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Send a control message to the origin
    pub async fn send_control(&mut self, message: SignalingMessage) -> PlayerResult<()> {
        if self.closed {
            return Err(PlayerError::TransportClosed {
                reason: "transport already closed".to_string(),
            });
        }
        send_message(&mut self.ws, &message, &self.endpoint).await
    }

    /// Tell the origin we are leaving and close the signaling connection
    pub async fn close(&mut self) -> PlayerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = send_message(&mut self.ws, &SignalingMessage::Stop, &self.endpoint).await;
        if let Err(e) = self.ws.close(None).await {
            debug!("Signaling close for {} failed: {}", self.endpoint, e);
        }
        info!("Transport to {} closed", self.endpoint);
        Ok(())
    }

    /// Selected transport mode
    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Origin-assigned session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Negotiated tracks
    pub fn tracks(&self) -> &[TrackDescription] {
        &self.tracks
    }

    /// Signaling endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Address of the signaling peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Local address of the UDP media socket, if one is in use
    pub fn media_local_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Datagrams dropped because they did not parse
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets
    }

    /// Whether the connection has been closed by either side
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

async fn send_message(
    ws: &mut SignalingStream,
    message: &SignalingMessage,
    endpoint: &str,
) -> PlayerResult<()> {
    let json = serde_json::to_string(message).map_err(|e| PlayerError::Protocol {
        reason: format!("cannot encode signaling message: {}", e),
    })?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| PlayerError::Connection {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

fn validate_answer(answer: &PlayAnswer) -> PlayerResult<()> {
    if answer.tracks.is_empty() {
        return Err(PlayerError::Protocol {
            reason: "answer carries no tracks".to_string(),
        });
    }
    for (i, track) in answer.tracks.iter().enumerate() {
        if track.clock_rate == 0 {
            return Err(PlayerError::Protocol {
                reason: format!("track {} has a zero clock rate", track.kind),
            });
        }
        if answer.tracks[..i].iter().any(|t| t.kind == track.kind || t.ssrc == track.ssrc) {
            return Err(PlayerError::Protocol {
                reason: format!("duplicate {} track or SSRC {}", track.kind, track.ssrc),
            });
        }
    }
    Ok(())
}

/// HTTP statuses an origin uses to demand TLS
fn is_tls_required_status(status: u16) -> bool {
    status == 426 || (495..=497).contains(&status)
}

fn map_handshake_error(error: tungstenite::Error, endpoint: &str, secure: bool) -> PlayerError {
    match error {
        tungstenite::Error::Tls(e) => PlayerError::Certificate {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        },
        tungstenite::Error::Http(response) if is_tls_required_status(response.status().as_u16()) => {
            PlayerError::Certificate {
                endpoint: endpoint.to_string(),
                reason: if secure {
                    format!("origin rejected the client certificate ({})", response.status())
                } else {
                    format!("origin requires TLS ({})", response.status())
                },
            }
        }
        tungstenite::Error::Http(response) if response.status().as_u16() == 404 => {
            PlayerError::Protocol {
                reason: format!("no signaling endpoint at {}", endpoint),
            }
        }
        tungstenite::Error::Io(e)
            if secure
                && e.get_ref()
                    .map(|inner| inner.is::<rustls::Error>())
                    .unwrap_or(false) =>
        {
            PlayerError::Certificate {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        }
        other => PlayerError::Connection {
            endpoint: endpoint.to_string(),
            reason: other.to_string(),
        },
    }
}

fn bind_media_socket(remote: SocketAddr, recv_buffer: usize) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        debug!("Could not raise UDP receive buffer to {}: {}", recv_buffer, e);
    }
    socket.set_nonblocking(true)?;
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_demand_statuses() {
        assert!(is_tls_required_status(426));
        assert!(is_tls_required_status(496));
        assert!(!is_tls_required_status(404));
        assert!(!is_tls_required_status(200));
    }

    #[test]
    fn answers_without_tracks_are_rejected() {
        let answer = PlayAnswer {
            session_id: "s".to_string(),
            tracks: vec![],
            candidates: vec![],
            binding_token: 1,
        };
        assert!(matches!(
            validate_answer(&answer),
            Err(PlayerError::Protocol { .. })
        ));
    }

    #[test]
    fn duplicate_tracks_are_rejected() {
        let answer = PlayAnswer {
            session_id: "s".to_string(),
            tracks: vec![
                TrackDescription::audio(codec_names::L16, 96, 1, 16_000, 1),
                TrackDescription::audio(codec_names::L16, 97, 2, 16_000, 1),
            ],
            candidates: vec![],
            binding_token: 1,
        };
        assert!(validate_answer(&answer).is_err());
    }
}
