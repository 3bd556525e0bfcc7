//! RTP and RTCP wire format (RFC 3550, RFC 5761 multiplexing)
//!
//! Only the parts a receiving player needs are modelled: the RTP fixed header
//! with CSRC list, header extension and padding, RTCP sender reports and BYE,
//! plus a packetizer used by the origin and by tests.

use crate::error::PlayerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// RTP protocol version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// Size of the RTP fixed header
pub const RTP_HEADER_LEN: usize = 12;

/// RTCP packet type for sender reports
pub const RTCP_SENDER_REPORT: u8 = 200;
/// RTCP packet type for receiver reports
pub const RTCP_RECEIVER_REPORT: u8 = 201;
/// RTCP packet type for BYE
pub const RTCP_BYE: u8 = 203;

/// Parsed RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Marker bit (last packet of a frame for the formats used here)
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// 16-bit sequence number
    pub sequence: u16,
    /// Media timestamp in clock-rate units
    pub timestamp: u32,
    /// Synchronization source
    pub ssrc: u32,
    /// Contributing sources
    pub csrcs: Vec<u32>,
    /// Header extension profile and data, if present
    pub extension: Option<(u16, Bytes)>,
    /// Payload with padding removed
    pub payload: Bytes,
}

impl RtpPacket {
    /// Build a packet without CSRCs or extension
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, marker: bool, payload: Bytes) -> Self {
        Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extension: None,
            payload,
        }
    }

    /// Parse a packet from a datagram
    pub fn parse(data: Bytes) -> Result<Self, PlayerError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(PlayerError::InvalidPacket {
                reason: format!("RTP packet too short: {} bytes", data.len()),
            });
        }

        let mut buf = data.clone();
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();

        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(PlayerError::InvalidPacket {
                reason: format!("unsupported RTP version {}", version),
            });
        }
        let has_padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(PlayerError::InvalidPacket {
                reason: "truncated CSRC list".to_string(),
            });
        }
        let csrcs = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(PlayerError::InvalidPacket {
                    reason: "truncated header extension".to_string(),
                });
            }
            let profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(PlayerError::InvalidPacket {
                    reason: "header extension overruns packet".to_string(),
                });
            }
            Some((profile, buf.split_to(words * 4)))
        } else {
            None
        };

        let mut payload = buf;
        if has_padding {
            let pad = payload.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > payload.len() {
                return Err(PlayerError::InvalidPacket {
                    reason: format!("invalid padding length {}", pad),
                });
            }
            payload.truncate(payload.len() - pad);
        }

        Ok(Self {
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7f,
            sequence,
            timestamp,
            ssrc,
            csrcs,
            extension,
            payload,
        })
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Bytes {
        let ext_len = self.extension.as_ref().map(|(_, d)| 4 + d.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(
            RTP_HEADER_LEN + self.csrcs.len() * 4 + ext_len + self.payload.len(),
        );

        let mut b0 = RTP_VERSION << 6 | (self.csrcs.len() as u8 & 0x0f);
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        buf.put_u8(b0);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
        if let Some((profile, data)) = &self.extension {
            buf.put_u16(*profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(data);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// NTP timestamp as carried in sender reports (seconds since 1900, 32.32 fixed point)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Build from whole seconds and a 32-bit fraction
    pub fn from_parts(seconds: u32, fraction: u32) -> Self {
        Self(((seconds as u64) << 32) | fraction as u64)
    }

    /// Timestamp expressed in microseconds
    pub fn as_micros(&self) -> u64 {
        let seconds = self.0 >> 32;
        let fraction = self.0 & 0xffff_ffff;
        seconds * 1_000_000 + ((fraction * 1_000_000) >> 32)
    }

    /// Current wall-clock time as NTP
    pub fn now() -> Self {
        const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = since_epoch.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self((seconds << 32) | fraction)
    }
}

/// RTCP sender report (report blocks are skipped)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    /// Sender SSRC
    pub ssrc: u32,
    /// Wall-clock time of the report
    pub ntp: NtpTimestamp,
    /// RTP timestamp corresponding to `ntp`
    pub rtp_timestamp: u32,
    /// Packets sent so far
    pub packet_count: u32,
    /// Payload octets sent so far
    pub octet_count: u32,
}

impl SenderReport {
    /// Serialize as a standalone RTCP packet with no report blocks
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(RTCP_SENDER_REPORT);
        buf.put_u16(6);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp.0);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        buf.freeze()
    }
}

/// One packet of a (possibly compound) RTCP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender report
    SenderReport(SenderReport),
    /// Sources leaving the session
    Bye {
        /// SSRCs that said goodbye
        ssrcs: Vec<u32>,
    },
    /// Any other packet type, kept for counting only
    Other {
        /// RTCP packet type
        packet_type: u8,
    },
}

impl RtcpPacket {
    /// Parse a compound RTCP datagram
    pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, PlayerError> {
        let mut packets = Vec::new();
        let mut buf = data;

        while !buf.is_empty() {
            if buf.len() < 4 {
                return Err(PlayerError::InvalidPacket {
                    reason: "truncated RTCP header".to_string(),
                });
            }
            let b0 = buf[0];
            if b0 >> 6 != RTP_VERSION {
                return Err(PlayerError::InvalidPacket {
                    reason: format!("unsupported RTCP version {}", b0 >> 6),
                });
            }
            let count = (b0 & 0x1f) as usize;
            let packet_type = buf[1];
            let len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;
            if buf.len() < len {
                return Err(PlayerError::InvalidPacket {
                    reason: format!("RTCP length {} overruns datagram of {}", len, buf.len()),
                });
            }
            let mut body = &buf[4..len];

            let packet = match packet_type {
                RTCP_SENDER_REPORT => {
                    if body.len() < 24 {
                        return Err(PlayerError::InvalidPacket {
                            reason: "truncated sender report".to_string(),
                        });
                    }
                    RtcpPacket::SenderReport(SenderReport {
                        ssrc: body.get_u32(),
                        ntp: NtpTimestamp(body.get_u64()),
                        rtp_timestamp: body.get_u32(),
                        packet_count: body.get_u32(),
                        octet_count: body.get_u32(),
                    })
                }
                RTCP_BYE => {
                    let mut ssrcs = Vec::with_capacity(count);
                    for _ in 0..count {
                        if body.remaining() < 4 {
                            break;
                        }
                        ssrcs.push(body.get_u32());
                    }
                    RtcpPacket::Bye { ssrcs }
                }
                other => RtcpPacket::Other { packet_type: other },
            };
            packets.push(packet);
            buf = &buf[len..];
        }

        Ok(packets)
    }
}

/// Inbound media datagram after RTP/RTCP demultiplexing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    /// Media packet
    Rtp(RtpPacket),
    /// Control packets
    Rtcp(Vec<RtcpPacket>),
}

impl InboundPacket {
    /// Classify and parse a datagram using the RFC 5761 payload-type rule
    pub fn parse(data: Bytes) -> Result<Self, PlayerError> {
        if is_rtcp(&data) {
            RtcpPacket::parse_compound(&data).map(InboundPacket::Rtcp)
        } else {
            RtpPacket::parse(data).map(InboundPacket::Rtp)
        }
    }
}

/// Whether a multiplexed datagram carries RTCP
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (64..=95).contains(&(data[1] & 0x7f))
}

/// Splits frames into MTU-sized RTP packets
#[derive(Debug, Clone)]
pub struct RtpPacketizer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    max_payload: usize,
    packets_sent: u32,
    octets_sent: u32,
}

impl RtpPacketizer {
    /// Create a packetizer starting at `initial_sequence`
    pub fn new(payload_type: u8, ssrc: u32, initial_sequence: u16, mtu: usize) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: initial_sequence,
            max_payload: mtu.saturating_sub(RTP_HEADER_LEN).max(1),
            packets_sent: 0,
            octets_sent: 0,
        }
    }

    /// Packetize one frame; the marker bit is set on the last packet
    pub fn packetize(&mut self, timestamp: u32, frame: &[u8]) -> Vec<RtpPacket> {
        let chunks: Vec<&[u8]> = if frame.is_empty() {
            vec![frame]
        } else {
            frame.chunks(self.max_payload).collect()
        };
        let last = chunks.len() - 1;

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let packet = RtpPacket::new(
                    self.payload_type,
                    self.sequence,
                    timestamp,
                    self.ssrc,
                    i == last,
                    Bytes::copy_from_slice(chunk),
                );
                self.sequence = self.sequence.wrapping_add(1);
                self.packets_sent = self.packets_sent.wrapping_add(1);
                self.octets_sent = self.octets_sent.wrapping_add(chunk.len() as u32);
                packet
            })
            .collect()
    }

    /// Sender report describing what was sent so far
    pub fn sender_report(&self, ntp: NtpTimestamp, rtp_timestamp: u32) -> SenderReport {
        SenderReport {
            ssrc: self.ssrc,
            ntp,
            rtp_timestamp,
            packet_count: self.packets_sent,
            octet_count: self.octets_sent,
        }
    }

    /// Next sequence number to be used
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }
}

/// Extends 16-bit sequence numbers (or 32-bit timestamps) across wraparound
#[derive(Debug, Clone, Default)]
pub struct SequenceUnwrapper {
    last: Option<u64>,
}

impl SequenceUnwrapper {
    /// Unwrap a 16-bit sequence number
    pub fn unwrap_sequence(&mut self, value: u16) -> u64 {
        self.unwrap_with(value as u64, 1 << 16)
    }

    /// Unwrap a 32-bit RTP timestamp
    pub fn unwrap_timestamp(&mut self, value: u32) -> u64 {
        self.unwrap_with(value as u64, 1 << 32)
    }

    fn unwrap_with(&mut self, value: u64, modulus: u64) -> u64 {
        // The first value lands in cycle 1 so a backwards step never underflows.
        let extended = match self.last {
            None => value + modulus,
            Some(last) => {
                let forward = (value + modulus - last % modulus) % modulus;
                if forward < modulus / 2 {
                    last + forward
                } else {
                    last - (modulus - forward)
                }
            }
        };
        if self.last.map_or(true, |last| extended > last) {
            self.last = Some(extended);
        }
        extended
    }
}
