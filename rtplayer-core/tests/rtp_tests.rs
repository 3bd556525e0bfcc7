//! Tests for the RTP/RTCP wire format
//!
//! Covers header parsing edge cases, RFC 5761 demultiplexing, the packetizer
//! and sequence number unwrapping.

use bytes::{BufMut, Bytes, BytesMut};
use rtplayer_core::rtp::{is_rtcp, RTCP_BYE};
use rtplayer_core::*;

#[test]
fn test_parse_header_fields() {
    let packet = RtpPacket::new(96, 4242, 90_000, 0x1234_5678, true, Bytes::from_static(b"abc"));
    let parsed = RtpPacket::parse(packet.to_bytes()).unwrap();

    assert_eq!(parsed.payload_type, 96);
    assert_eq!(parsed.sequence, 4242);
    assert_eq!(parsed.timestamp, 90_000);
    assert_eq!(parsed.ssrc, 0x1234_5678);
    assert!(parsed.marker);
    assert_eq!(&parsed.payload[..], b"abc");
}

#[test]
fn test_parse_csrc_extension_and_padding() {
    let mut buf = BytesMut::new();
    // V=2, P=1, X=1, CC=2
    buf.put_u8(0b1011_0010);
    buf.put_u8(97);
    buf.put_u16(7);
    buf.put_u32(1000);
    buf.put_u32(42);
    buf.put_u32(1);
    buf.put_u32(2);
    // one-word extension
    buf.put_u16(0xBEDE);
    buf.put_u16(1);
    buf.put_u32(0xAABB_CCDD);
    buf.put_slice(b"media");
    // three bytes of padding, last one is the count
    buf.put_slice(&[0, 0, 3]);

    let parsed = RtpPacket::parse(buf.freeze()).unwrap();
    assert_eq!(parsed.csrcs, vec![1, 2]);
    let (profile, data) = parsed.extension.unwrap();
    assert_eq!(profile, 0xBEDE);
    assert_eq!(&data[..], &[0xAA, 0xBB, 0xCC, 0xDD]);
    assert_eq!(&parsed.payload[..], b"media");
    assert!(!parsed.marker);
}

#[test]
fn test_reject_malformed_packets() {
    assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 96, 0])).is_err());

    let mut wrong_version = RtpPacket::new(96, 1, 1, 1, false, Bytes::new()).to_bytes().to_vec();
    wrong_version[0] = 0x40;
    let err = RtpPacket::parse(Bytes::from(wrong_version)).unwrap_err();
    assert_eq!(err.error_code(), "INVALID_PACKET");

    // CSRC count claims more than the packet holds
    let mut truncated = RtpPacket::new(96, 1, 1, 1, false, Bytes::new()).to_bytes().to_vec();
    truncated[0] |= 0x0f;
    assert!(RtpPacket::parse(Bytes::from(truncated)).is_err());
}

#[test]
fn test_rtcp_demultiplexing() {
    let rtp = RtpPacket::new(96, 1, 1, 1, true, Bytes::from_static(b"x")).to_bytes();
    assert!(!is_rtcp(&rtp));

    let sr = SenderReport {
        ssrc: 9,
        ntp: NtpTimestamp::from_parts(3_900_000_000, 1 << 31),
        rtp_timestamp: 48_000,
        packet_count: 10,
        octet_count: 1200,
    };
    let wire = sr.to_bytes();
    assert!(is_rtcp(&wire));

    match InboundPacket::parse(wire).unwrap() {
        InboundPacket::Rtcp(packets) => {
            assert_eq!(packets, vec![RtcpPacket::SenderReport(sr)]);
        }
        other => panic!("expected RTCP, got {:?}", other),
    }
}

#[test]
fn test_compound_rtcp_with_bye() {
    let sr = SenderReport {
        ssrc: 5,
        ntp: NtpTimestamp::from_parts(1, 0),
        rtp_timestamp: 0,
        packet_count: 0,
        octet_count: 0,
    };
    let mut compound = BytesMut::from(&sr.to_bytes()[..]);
    compound.put_u8(0x80 | 1);
    compound.put_u8(RTCP_BYE);
    compound.put_u16(1);
    compound.put_u32(5);

    let packets = RtcpPacket::parse_compound(&compound).unwrap();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[1], RtcpPacket::Bye { ssrcs: vec![5] });
}

#[test]
fn test_bye_with_short_body_keeps_complete_ssrcs() {
    // source count says two, the length word covers one
    let mut bye = BytesMut::new();
    bye.put_u8(0x80 | 2);
    bye.put_u8(RTCP_BYE);
    bye.put_u16(1);
    bye.put_u32(9);

    let packets = RtcpPacket::parse_compound(&bye).unwrap();
    assert_eq!(packets, vec![RtcpPacket::Bye { ssrcs: vec![9] }]);
}

#[test]
fn test_ntp_to_micros() {
    let ntp = NtpTimestamp::from_parts(2, 1 << 31);
    assert_eq!(ntp.as_micros(), 2_500_000);
}

#[test]
fn test_packetizer_fragments_at_mtu() {
    let mut packetizer = RtpPacketizer::new(97, 77, 65_534, 112);
    let frame = vec![7u8; 250];

    let packets = packetizer.packetize(3000, &frame);
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0].payload.len(), 100);
    assert_eq!(packets[2].payload.len(), 50);
    assert!(packets.iter().all(|p| p.timestamp == 3000 && p.ssrc == 77));
    assert_eq!(
        packets.iter().map(|p| p.marker).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert_eq!(
        packets.iter().map(|p| p.sequence).collect::<Vec<_>>(),
        vec![65_534, 65_535, 0]
    );

    let report = packetizer.sender_report(NtpTimestamp::from_parts(1, 0), 3000);
    assert_eq!(report.packet_count, 3);
    assert_eq!(report.octet_count, 250);
}

#[test]
fn test_sequence_unwrapping_across_wrap() {
    let mut unwrapper = SequenceUnwrapper::default();
    let first = unwrapper.unwrap_sequence(65_534);
    assert_eq!(unwrapper.unwrap_sequence(65_535), first + 1);
    assert_eq!(unwrapper.unwrap_sequence(0), first + 2);
    assert_eq!(unwrapper.unwrap_sequence(1), first + 3);
    // a straggler from before the wrap keeps its place
    assert_eq!(unwrapper.unwrap_sequence(65_535), first + 1);
    assert_eq!(unwrapper.unwrap_sequence(2), first + 4);
}

#[test]
fn test_timestamp_unwrapping_backwards_step() {
    let mut unwrapper = SequenceUnwrapper::default();
    let first = unwrapper.unwrap_timestamp(10);
    assert_eq!(unwrapper.unwrap_timestamp(u32::MAX), first - 11);
    assert_eq!(unwrapper.unwrap_timestamp(100), first + 90);
}
