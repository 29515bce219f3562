//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bytes::Bytes;
use const_addrs::ip;
use pim_sm::packet::assert::AssertMsg;
use pim_sm::packet::bootstrap::{
    BootstrapGroupPrefix, BootstrapMsg, BootstrapRp, CandRpAdvMsg,
};
use pim_sm::packet::error::DecodeError;
use pim_sm::packet::hello::{HelloMsg, LanPruneDelay};
use pim_sm::packet::join_prune::{
    EncodedSource, JoinPruneGroup, JoinPruneMsg, SourceFlags,
};
use pim_sm::packet::register::{RegisterMsg, RegisterStopMsg};
use pim_sm::packet::{EncodedGroup, Packet};
use pim_utils::ip::AddressFamily;

static HELLO1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x20, 0x00, 0x35, 0x41, 0x00, 0x01, 0x00, 0x02, 0x00, 0x69,
            0x00, 0x02, 0x00, 0x04, 0x01, 0xf4, 0x09, 0xc4, 0x00, 0x13,
            0x00, 0x04, 0x00, 0x00, 0x00, 0xc8, 0x00, 0x14, 0x00, 0x04,
            0xde, 0xad, 0xbe, 0xef,
        ],
        Packet::Hello(HelloMsg {
            holdtime: Some(105),
            lan_prune_delay: Some(LanPruneDelay {
                t_bit: false,
                propagation_delay_msec: 500,
                override_interval_msec: 2500,
            }),
            dr_priority: Some(200),
            gen_id: Some(0xdeadbeef),
            addr_list: vec![],
            unknown_options: 0,
        }),
    )
});

static JOIN_PRUNE1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x23, 0x00, 0xc4, 0xd5, 0x01, 0x00, 0x0a, 0x00, 0x00, 0x01,
            0x00, 0x01, 0x00, 0xd2, 0x01, 0x00, 0x00, 0x20, 0xef, 0x09,
            0x09, 0x09, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x07, 0x20,
            0x0a, 0x01, 0x01, 0x01,
        ],
        Packet::JoinPrune(JoinPruneMsg {
            upstream_nbr: ip!("10.0.0.1"),
            holdtime: 210,
            groups: vec![JoinPruneGroup {
                group: EncodedGroup::new("239.9.9.9/32".parse().unwrap()),
                joins: vec![EncodedSource::new(
                    ip!("10.1.1.1"),
                    32,
                    SourceFlags::SPARSE
                        | SourceFlags::WC
                        | SourceFlags::RPT,
                )],
                prunes: vec![],
            }],
        }),
    )
});

static ASSERT1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x25, 0x00, 0xc6, 0x3a, 0x01, 0x00, 0x00, 0x20, 0xe8, 0x00,
            0x00, 0x01, 0x01, 0x00, 0xc6, 0x33, 0x64, 0x01, 0x00, 0x00,
            0x00, 0x64, 0x00, 0x00, 0x00, 0x0a,
        ],
        Packet::Assert(AssertMsg {
            group: EncodedGroup::new("232.0.0.1/32".parse().unwrap()),
            source: ip!("198.51.100.1"),
            rpt_bit: false,
            metric_preference: 100,
            metric: 10,
        }),
    )
});

static REGISTER_STOP1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x22, 0x00, 0x25, 0xcd, 0x01, 0x00, 0x00, 0x20, 0xef, 0x05,
            0x05, 0x05, 0x01, 0x00, 0xc0, 0x00, 0x02, 0x07,
        ],
        Packet::RegisterStop(RegisterStopMsg {
            group: EncodedGroup::new("239.5.5.5/32".parse().unwrap()),
            source: ip!("192.0.2.7"),
        }),
    )
});

static BOOTSTRAP1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x24, 0x00, 0x90, 0x81, 0x12, 0x34, 0x1e, 0x96, 0x01, 0x00,
            0x0a, 0x00, 0x00, 0x02, 0x01, 0x00, 0x00, 0x08, 0xef, 0x00,
            0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x0a, 0x09,
            0x09, 0x09, 0x00, 0x96, 0x0a, 0x00,
        ],
        Packet::Bootstrap(BootstrapMsg {
            fragment_tag: 0x1234,
            hash_mask_len: 30,
            bsr_priority: 150,
            bsr_addr: ip!("10.0.0.2"),
            group_prefixes: vec![BootstrapGroupPrefix {
                group_prefix: EncodedGroup::new("239.0.0.0/8".parse().unwrap()),
                rp_count: 1,
                rps: vec![BootstrapRp {
                    addr: ip!("10.9.9.9"),
                    holdtime: 150,
                    priority: 10,
                }],
            }],
        }),
    )
});

// A Null-Register probe: the checksum covers only the first 8 octets.
static REGISTER_NULL1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x21, 0x00, 0x9e, 0xff, 0x40, 0x00, 0x00, 0x00, 0x45, 0x00,
            0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x67, 0x04, 0x72,
            0xc0, 0x00, 0x02, 0x07, 0xef, 0x05, 0x05, 0x05,
        ],
        Packet::Register(RegisterMsg {
            border: false,
            null_register: true,
            inner: Bytes::from_static(&[
                0x45, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x67, 0x04, 0x72, 0xc0, 0x00, 0x02, 0x07, 0xef, 0x05,
                0x05, 0x05,
            ]),
        }),
    )
});

static CAND_RP_ADV1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x28, 0x00, 0xd8, 0x9c, 0x01, 0xc0, 0x00, 0x96, 0x01, 0x00,
            0x0a, 0x02, 0x02, 0x02, 0x01, 0x00, 0x00, 0x08, 0xef, 0x00,
            0x00, 0x00,
        ],
        Packet::CandRpAdv(CandRpAdvMsg {
            priority: 192,
            holdtime: 150,
            rp_addr: ip!("10.2.2.2"),
            group_prefixes: vec![EncodedGroup::new("239.0.0.0/8".parse().unwrap())],
        }),
    )
});

fn test_encode_packet(bytes_expected: &[u8], packet: &Packet) {
    let bytes_actual = packet.encode(AddressFamily::Ipv4);
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(bytes: &[u8], packet_expected: &Packet) {
    let packet_actual =
        Packet::decode(AddressFamily::Ipv4, bytes).unwrap();
    assert_eq!(*packet_expected, packet_actual);
}

#[test]
fn test_encode_hello() {
    let (ref bytes, ref packet) = *HELLO1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_hello() {
    let (ref bytes, ref packet) = *HELLO1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_hello_bad_checksum() {
    let (ref bytes, _) = *HELLO1;
    let mut bytes = bytes.clone();
    bytes[2] ^= 0xff;
    assert_eq!(
        Packet::decode(AddressFamily::Ipv4, &bytes),
        Err(DecodeError::InvalidChecksum),
    );
}

#[test]
fn test_decode_hello_unknown_option() {
    // A Hello with holdtime plus an unknown option type 99: the option
    // is skipped and counted.
    let mut body = vec![
        0x00, 0x01, 0x00, 0x02, 0x00, 0x69, // holdtime 105
        0x00, 0x63, 0x00, 0x02, 0xab, 0xcd, // unknown
    ];
    let mut msg = vec![0x20, 0x00, 0x00, 0x00];
    msg.append(&mut body);
    let cksum = internet_checksum::checksum(&msg);
    msg[2] = cksum[0];
    msg[3] = cksum[1];

    let packet = Packet::decode(AddressFamily::Ipv4, &msg).unwrap();
    let Packet::Hello(hello) = packet else {
        panic!("expected a Hello");
    };
    assert_eq!(hello.holdtime, Some(105));
    assert_eq!(hello.unknown_options, 1);
}

#[test]
fn test_decode_unknown_version() {
    let (ref bytes, _) = *HELLO1;
    let mut bytes = bytes.clone();
    bytes[0] = (3 << 4) | (bytes[0] & 0x0f);
    assert!(matches!(
        Packet::decode(AddressFamily::Ipv4, &bytes),
        Err(DecodeError::InvalidVersion(3)),
    ));
}

#[test]
fn test_decode_truncated() {
    let (ref bytes, _) = *JOIN_PRUNE1;
    assert!(Packet::decode(AddressFamily::Ipv4, &bytes[..10]).is_err());
}

#[test]
fn test_encode_join_prune() {
    let (ref bytes, ref packet) = *JOIN_PRUNE1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_join_prune() {
    let (ref bytes, ref packet) = *JOIN_PRUNE1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_assert() {
    let (ref bytes, ref packet) = *ASSERT1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_assert() {
    let (ref bytes, ref packet) = *ASSERT1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_register_stop() {
    let (ref bytes, ref packet) = *REGISTER_STOP1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_register_stop() {
    let (ref bytes, ref packet) = *REGISTER_STOP1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_bootstrap() {
    let (ref bytes, ref packet) = *BOOTSTRAP1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_bootstrap() {
    let (ref bytes, ref packet) = *BOOTSTRAP1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_register_null() {
    let (ref bytes, ref packet) = *REGISTER_NULL1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_register_null() {
    let (ref bytes, ref packet) = *REGISTER_NULL1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_register_checksum_covers_header_only() {
    // Corrupting the encapsulated datagram must not fail the checksum.
    let (ref bytes, _) = *REGISTER_NULL1;
    let mut bytes = bytes.clone();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(Packet::decode(AddressFamily::Ipv4, &bytes).is_ok());
}

#[test]
fn test_encode_cand_rp_adv() {
    let (ref bytes, ref packet) = *CAND_RP_ADV1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_cand_rp_adv() {
    let (ref bytes, ref packet) = *CAND_RP_ADV1;
    test_decode_packet(bytes, packet);
}
