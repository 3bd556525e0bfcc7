//! RFC 6184 H.264 depacketization into Annex-B access units

use bytes::{BufMut, Bytes, BytesMut};
use rtplayer_core::PlayerError;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_IDR: u8 = 5;
const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// An access unit rebuilt from the RTP payloads of one frame
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Annex-B byte stream
    pub data: Bytes,
    /// Whether the unit contains an IDR slice
    pub is_keyframe: bool,
}

/// Convert the payloads of one frame, in sequence order, to Annex-B
pub fn depacketize<'a, I>(payloads: I) -> Result<AccessUnit, PlayerError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = BytesMut::new();
    let mut is_keyframe = false;
    let mut in_fragment = false;

    for payload in payloads {
        let Some(&indicator) = payload.first() else {
            continue;
        };
        let nal_type = indicator & 0x1f;

        match nal_type {
            1..=23 => {
                is_keyframe |= nal_type == NAL_IDR;
                out.put_slice(&START_CODE);
                out.put_slice(payload);
            }
            STAP_A => {
                let mut rest = &payload[1..];
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    rest = &rest[2..];
                    if size == 0 || size > rest.len() {
                        return Err(invalid(format!("STAP-A unit of {} bytes overruns packet", size)));
                    }
                    is_keyframe |= rest[0] & 0x1f == NAL_IDR;
                    out.put_slice(&START_CODE);
                    out.put_slice(&rest[..size]);
                    rest = &rest[size..];
                }
            }
            FU_A => {
                if payload.len() < 2 {
                    return Err(invalid("truncated FU-A header".to_string()));
                }
                let header = payload[1];
                let start = header & 0x80 != 0;
                let end = header & 0x40 != 0;
                let inner_type = header & 0x1f;

                if start {
                    is_keyframe |= inner_type == NAL_IDR;
                    out.put_slice(&START_CODE);
                    out.put_u8((indicator & 0xe0) | inner_type);
                    in_fragment = true;
                } else if !in_fragment {
                    return Err(invalid("FU-A continuation without a start fragment".to_string()));
                }
                out.put_slice(&payload[2..]);
                if end {
                    in_fragment = false;
                }
            }
            other => {
                return Err(PlayerError::UnsupportedCodec {
                    codec: format!("H264 packetization type {}", other),
                })
            }
        }
    }

    if out.is_empty() {
        return Err(invalid("access unit carries no NAL units".to_string()));
    }

    Ok(AccessUnit {
        data: out.freeze(),
        is_keyframe,
    })
}

/// Whether a payload can begin decoding: a whole NAL unit, an aggregate, or
/// the first fragment of a FU-A
pub fn starts_access_unit(payload: &[u8]) -> bool {
    match payload.first().map(|b| b & 0x1f) {
        Some(1..=23) | Some(STAP_A) => true,
        Some(FU_A) => payload.get(1).is_some_and(|header| header & 0x80 != 0),
        _ => false,
    }
}

fn invalid(reason: String) -> PlayerError {
    PlayerError::InvalidPacket { reason }
}
