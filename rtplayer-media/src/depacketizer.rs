//! Demultiplexing and frame reassembly
//!
//! Packets are attributed to a negotiated track by SSRC, falling back to the
//! payload type. Each track keeps its own reorder window keyed by unwrapped
//! sequence number and emits frames in sequence order. Packets no track
//! claims are held for a grace period so a late track announcement can still
//! pick them up.

use crate::h264;
use crate::tracks::EncodedFrame;
use bytes::{Bytes, BytesMut};
use rtplayer_core::{
    InboundPacket, RtcpPacket, RtpPacket, SenderReport, SequenceUnwrapper, StreamCounters,
    TrackDescription, TrackKind,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for the depacketizer
#[derive(Debug, Clone)]
pub struct DepacketizerConfig {
    /// How long packets of an unknown track are held before being discarded
    pub unknown_track_grace: Duration,
    /// Maximum number of unattributed packets held at once
    pub max_unknown_packets: usize,
    /// How long an incomplete frame may wait for missing packets
    pub reassembly_timeout: Duration,
    /// How long a track whose packets are whole frames waits for a missing
    /// packet before skipping it; keep it well below the playout delay
    pub reorder_window: Duration,
    /// Packets a single track may hold while waiting for a gap to fill
    pub max_pending_packets: usize,
}

impl Default for DepacketizerConfig {
    fn default() -> Self {
        Self {
            unknown_track_grace: Duration::from_millis(500),
            max_unknown_packets: 256,
            reassembly_timeout: Duration::from_millis(150),
            reorder_window: Duration::from_millis(20),
            max_pending_packets: 1024,
        }
    }
}

/// Output of the depacketizer
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// First frame of a track was reassembled (raised once per track)
    TrackReceived(TrackKind),
    /// A complete frame
    Frame(EncodedFrame),
}

#[derive(Debug)]
struct PendingPacket {
    packet: RtpPacket,
    timestamp: u64,
    arrival: Instant,
}

#[derive(Debug)]
struct TrackAssembly {
    desc: TrackDescription,
    sequence: SequenceUnwrapper,
    timestamps: SequenceUnwrapper,
    pending: BTreeMap<u64, PendingPacket>,
    next_seq: Option<u64>,
    /// Whether `next_seq` is known to start a frame
    synced: bool,
    /// Timestamp of a frame given up on before its last packet arrived
    open_timestamp: Option<u64>,
    emitted_any: bool,
    first_timestamp: Option<u64>,
    pts_offset_us: i64,
    received: bool,
}

impl TrackAssembly {
    fn new(desc: TrackDescription) -> Self {
        Self {
            desc,
            sequence: SequenceUnwrapper::default(),
            timestamps: SequenceUnwrapper::default(),
            pending: BTreeMap::new(),
            next_seq: None,
            synced: true,
            open_timestamp: None,
            emitted_any: false,
            first_timestamp: None,
            pts_offset_us: 0,
            received: false,
        }
    }

    fn kind(&self) -> TrackKind {
        self.desc.kind
    }

    /// Every audio payload format in use carries whole frames per packet
    fn packet_is_frame(&self) -> bool {
        self.desc.kind == TrackKind::Audio
    }

    /// How long the head of the queue may wait for a missing packet
    fn gap_wait(&self, config: &DepacketizerConfig) -> Duration {
        if self.packet_is_frame() {
            config.reorder_window.min(config.reassembly_timeout)
        } else {
            config.reassembly_timeout
        }
    }

    /// Whether `first`, found right after `lost` missing packets, begins a frame
    fn starts_frame_after_gap(&self, first: &PendingPacket, lost: u64) -> bool {
        if self.packet_is_frame() {
            return true;
        }
        // The abandoned frame still needed at least one packet, so a single
        // missing packet was its tail and a new timestamp starts the next frame.
        if lost == 1 && self.open_timestamp.is_some_and(|ts| ts != first.timestamp) {
            return true;
        }
        self.desc.is_h264() && h264::starts_access_unit(&first.packet.payload)
    }

    fn accept(&mut self, packet: RtpPacket, now: Instant, counters: &StreamCounters) {
        let ext = self.sequence.unwrap_sequence(packet.sequence);
        match self.next_seq {
            None => self.next_seq = Some(ext),
            Some(next) if ext < next => {
                if self.emitted_any {
                    counters.record_late();
                    debug!("Late {} packet seq={} dropped", self.kind(), packet.sequence);
                    return;
                }
                // still before the first frame: reordering at stream start
                self.next_seq = Some(ext);
            }
            Some(_) => {}
        }

        if self.pending.contains_key(&ext) {
            debug!("Duplicate {} packet seq={} ignored", self.kind(), packet.sequence);
            return;
        }

        counters.record_packet(self.kind(), packet.payload.len());
        let timestamp = self.timestamps.unwrap_timestamp(packet.timestamp);
        self.pending.insert(
            ext,
            PendingPacket {
                packet,
                timestamp,
                arrival: now,
            },
        );
    }

    /// Pull every frame that is complete or has given up waiting
    fn drain(
        &mut self,
        now: Instant,
        config: &DepacketizerConfig,
        counters: &StreamCounters,
    ) -> Vec<Vec<PendingPacket>> {
        let mut frames = Vec::new();

        loop {
            let Some(next) = self.next_seq else { break };
            let Some((&first_key, first)) = self.pending.iter().next() else { break };
            let expired = now.saturating_duration_since(first.arrival) >= self.gap_wait(config)
                || self.pending.len() > config.max_pending_packets;
            let run_timestamp = first.timestamp;

            if first_key > next {
                if !expired {
                    break;
                }
                let lost = first_key - next;
                let resync = self.starts_frame_after_gap(first, lost);
                counters.record_lost(lost);
                debug!("{} track lost {} packet(s) before seq {}", self.kind(), lost, first_key);
                self.next_seq = Some(first_key);
                self.synced = resync;
                self.open_timestamp = None;
                continue;
            }

            // Walk the contiguous run sharing the first packet's timestamp.
            let mut key = next;
            let mut last = None;
            while let Some(pending) = self.pending.get(&key) {
                if pending.timestamp != run_timestamp {
                    last = Some(key - 1);
                    break;
                }
                if pending.packet.marker || self.packet_is_frame() {
                    last = Some(key);
                    break;
                }
                key += 1;
            }

            match last {
                Some(last) => {
                    let packets: Vec<PendingPacket> =
                        (next..=last).filter_map(|k| self.pending.remove(&k)).collect();
                    self.next_seq = Some(last + 1);
                    if self.synced {
                        frames.push(packets);
                    } else {
                        counters.record_dropped(self.kind());
                        debug!("Dropped {} frame missing its leading packets", self.kind());
                    }
                    self.synced = true;
                    self.open_timestamp = None;
                }
                None if expired => {
                    for k in next..key {
                        self.pending.remove(&k);
                    }
                    counters.record_dropped(self.kind());
                    debug!("Dropped incomplete {} frame after {:?}", self.kind(), config.reassembly_timeout);
                    self.next_seq = Some(key);
                    self.synced = false;
                    self.open_timestamp = Some(run_timestamp);
                }
                None => break,
            }
        }

        frames
    }

    fn pts(&self, timestamp: u64) -> Duration {
        let first = self.first_timestamp.unwrap_or(timestamp);
        let elapsed_us = (timestamp.saturating_sub(first) as u128 * 1_000_000
            / self.desc.clock_rate.max(1) as u128) as i64;
        Duration::from_micros((elapsed_us + self.pts_offset_us).max(0) as u64)
    }
}

/// Turns transport packets into per-track frames
#[derive(Debug)]
pub struct Depacketizer {
    config: DepacketizerConfig,
    tracks: Vec<TrackAssembly>,
    unknown: VecDeque<(Instant, RtpPacket)>,
    sender_reports: HashMap<u32, SenderReport>,
    /// Wall-clock time (NTP, microseconds) of pts zero
    timeline_origin_us: Option<u64>,
    counters: Arc<StreamCounters>,
}

impl Depacketizer {
    /// Create a depacketizer for the negotiated tracks
    pub fn new(
        config: DepacketizerConfig,
        tracks: &[TrackDescription],
        counters: Arc<StreamCounters>,
    ) -> Self {
        Self {
            config,
            tracks: tracks.iter().cloned().map(TrackAssembly::new).collect(),
            unknown: VecDeque::new(),
            sender_reports: HashMap::new(),
            timeline_origin_us: None,
            counters,
        }
    }

    /// Currently known tracks
    pub fn tracks(&self) -> impl Iterator<Item = &TrackDescription> {
        self.tracks.iter().map(|t| &t.desc)
    }

    /// Packets held waiting for a track announcement
    pub fn unknown_backlog(&self) -> usize {
        self.unknown.len()
    }

    /// Handle one inbound packet
    pub fn push(&mut self, packet: InboundPacket, now: Instant) -> Vec<DemuxEvent> {
        match packet {
            InboundPacket::Rtp(packet) => self.push_rtp(packet, now),
            InboundPacket::Rtcp(packets) => {
                self.handle_rtcp(packets);
                Vec::new()
            }
        }
    }

    /// Handle one RTP packet
    pub fn push_rtp(&mut self, packet: RtpPacket, now: Instant) -> Vec<DemuxEvent> {
        match self.track_index(&packet) {
            Some(index) => {
                self.tracks[index].accept(packet, now, &self.counters);
                self.drain_track(index, now)
            }
            None => {
                self.hold_unknown(packet, now);
                Vec::new()
            }
        }
    }

    /// Add a track announced after negotiation and replay its held packets
    pub fn announce_track(&mut self, desc: TrackDescription, now: Instant) -> Vec<DemuxEvent> {
        if self.tracks.iter().any(|t| t.desc.kind == desc.kind) {
            warn!("Ignoring second announcement of a {} track", desc.kind);
            return Vec::new();
        }
        info!("Late announcement of {} track (ssrc {})", desc.kind, desc.ssrc);
        self.tracks.push(TrackAssembly::new(desc));
        let index = self.tracks.len() - 1;

        let held: Vec<(Instant, RtpPacket)> = self.unknown.drain(..).collect();
        for (arrival, packet) in held {
            if self.track_index(&packet) == Some(index) {
                self.tracks[index].accept(packet, arrival, &self.counters);
            } else {
                self.unknown.push_back((arrival, packet));
            }
        }
        self.drain_track(index, now)
    }

    /// Apply timeouts: expire held packets and give up on stalled frames
    pub fn poll(&mut self, now: Instant) -> Vec<DemuxEvent> {
        while let Some((arrival, _)) = self.unknown.front() {
            if now.saturating_duration_since(*arrival) < self.config.unknown_track_grace {
                break;
            }
            self.unknown.pop_front();
            self.counters.record_discarded();
        }

        let mut events = Vec::new();
        for index in 0..self.tracks.len() {
            events.extend(self.drain_track(index, now));
        }
        events
    }

    fn track_index(&self, packet: &RtpPacket) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.desc.ssrc == packet.ssrc)
            .or_else(|| {
                let mut by_type = self
                    .tracks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.desc.payload_type == packet.payload_type);
                match (by_type.next(), by_type.next()) {
                    (Some((index, _)), None) => Some(index),
                    _ => None,
                }
            })
    }

    fn hold_unknown(&mut self, packet: RtpPacket, now: Instant) {
        debug!(
            "Holding packet of unknown track ssrc={} pt={}",
            packet.ssrc, packet.payload_type
        );
        if self.unknown.len() >= self.config.max_unknown_packets {
            self.unknown.pop_front();
            self.counters.record_discarded();
        }
        self.unknown.push_back((now, packet));
    }

    fn handle_rtcp(&mut self, packets: Vec<RtcpPacket>) {
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(report) => {
                    debug!("Sender report for ssrc {}", report.ssrc);
                    self.sender_reports.insert(report.ssrc, report);
                }
                RtcpPacket::Bye { ssrcs } => info!("Origin sent BYE for {:?}", ssrcs),
                RtcpPacket::Other { packet_type } => debug!("Ignoring RTCP type {}", packet_type),
            }
        }
    }

    fn drain_track(&mut self, index: usize, now: Instant) -> Vec<DemuxEvent> {
        let frames = self.tracks[index].drain(now, &self.config, &self.counters);
        let mut events = Vec::new();
        for packets in frames {
            if let Some(frame) = self.assemble(index, packets) {
                let track = &mut self.tracks[index];
                if !track.received {
                    track.received = true;
                    info!("First {} frame reassembled", track.kind());
                    events.push(DemuxEvent::TrackReceived(track.kind()));
                }
                events.push(DemuxEvent::Frame(frame));
            }
        }
        events
    }

    fn assemble(&mut self, index: usize, packets: Vec<PendingPacket>) -> Option<EncodedFrame> {
        let first = packets.first()?;
        let timestamp = first.timestamp;
        let rtp_timestamp = first.packet.timestamp;
        let arrival = packets.iter().map(|p| p.arrival).max().unwrap_or(first.arrival);

        let desc = &self.tracks[index].desc;
        let (payload, is_keyframe) = if desc.is_h264() {
            match h264::depacketize(packets.iter().map(|p| &p.packet.payload[..])) {
                Ok(unit) => (unit.data, unit.is_keyframe),
                Err(e) => {
                    warn!("Dropping malformed H264 access unit: {}", e);
                    self.counters.record_dropped(desc.kind);
                    return None;
                }
            }
        } else {
            (concat(&packets), true)
        };

        if self.tracks[index].first_timestamp.is_none() {
            self.init_timeline(index, timestamp, rtp_timestamp);
        }
        let track = &mut self.tracks[index];
        track.emitted_any = true;

        Some(EncodedFrame {
            kind: track.desc.kind,
            codec: track.desc.codec.clone(),
            pts: track.pts(timestamp),
            rtp_timestamp,
            payload,
            is_keyframe,
            arrival,
        })
    }

    /// Fix the track's offset on the shared timeline at its first frame
    fn init_timeline(&mut self, index: usize, timestamp: u64, rtp_timestamp: u32) {
        let track = &self.tracks[index];
        let clock_rate = track.desc.clock_rate.max(1) as i64;
        let wallclock_us = self.sender_reports.get(&track.desc.ssrc).map(|report| {
            let delta = rtp_timestamp.wrapping_sub(report.rtp_timestamp) as i32 as i64;
            report.ntp.as_micros() as i64 + delta * 1_000_000 / clock_rate
        });

        let offset = match (wallclock_us, self.timeline_origin_us) {
            (Some(now_us), Some(origin)) => now_us - origin as i64,
            (Some(now_us), None) => {
                self.timeline_origin_us = Some(now_us.max(0) as u64);
                0
            }
            (None, _) => 0,
        };
        debug!("{} timeline offset {} us", track.desc.kind, offset);

        let track = &mut self.tracks[index];
        track.first_timestamp = Some(timestamp);
        track.pts_offset_us = offset;
    }
}

fn concat(packets: &[PendingPacket]) -> Bytes {
    if packets.len() == 1 {
        return packets[0].packet.payload.clone();
    }
    let mut out = BytesMut::with_capacity(packets.iter().map(|p| p.packet.payload.len()).sum());
    for p in packets {
        out.extend_from_slice(&p.packet.payload);
    }
    out.freeze()
}
