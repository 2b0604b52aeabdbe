//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bfdd_core::packet::{
    AuthCtx, AuthTlv, AuthenticationType, DecodeError, Packet, PacketFlags,
};
use bfdd_utils::bfd::State;
use bfdd_utils::crypto::CryptoAlgo;
use bfdd_utils::keychain::Key;

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DecodeError>,
    auth: Option<&AuthCtx<'_>>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode(auth);
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> = Lazy::new(|| {
    (
        vec![
            0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
            0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
            0x00, 0x00, 0xc3, 0x50,
        ],
        Ok(Packet {
            version: 1,
            diag: 0,
            state: State::Up,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr: 0x9fb205d6,
            your_discr: 0x4a2357dc,
            desired_min_tx: 300000,
            req_min_rx: 300000,
            req_min_echo_rx: 50000,
            auth: None,
        }),
    )
});

static PACKET2: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> = Lazy::new(|| {
    (
        vec![
            0x23, 0x60, 0x05, 0x18, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x01, 0x86, 0xa0, 0x00, 0x00, 0x27, 0x10,
            0x00, 0x00, 0x00, 0x00,
        ],
        Ok(Packet {
            version: 1,
            diag: 3,
            state: State::Down,
            flags: PacketFlags::P,
            detect_mult: 5,
            my_discr: 1,
            your_discr: 0,
            desired_min_tx: 100000,
            req_min_rx: 10000,
            req_min_echo_rx: 0,
            auth: None,
        }),
    )
});

static PACKET3: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> = Lazy::new(|| {
    (
        vec![
            0x20, 0x44, 0x03, 0x21, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x0f, 0x42, 0x40,
            0x00, 0x00, 0x00, 0x00, 0x01, 0x09, 0x01, 0x73, 0x65, 0x63,
            0x72, 0x65, 0x74,
        ],
        Ok(Packet {
            version: 1,
            diag: 0,
            state: State::Down,
            flags: PacketFlags::A,
            detect_mult: 3,
            my_discr: 1,
            your_discr: 0,
            desired_min_tx: 1000000,
            req_min_rx: 1000000,
            req_min_echo_rx: 0,
            auth: Some(AuthTlv::SimplePassword {
                key_id: 1,
                password: b"secret".to_vec(),
            }),
        }),
    )
});

static PACKET4: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> = Lazy::new(|| {
    (
        vec![
            0x20, 0xc4, 0x03, 0x30, 0x11, 0x11, 0x11, 0x11, 0x22, 0x22,
            0x22, 0x22, 0x00, 0x01, 0x86, 0xa0, 0x00, 0x01, 0x86, 0xa0,
            0x00, 0x00, 0x00, 0x00, 0x02, 0x18, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x05, 0xa6, 0x38, 0x73, 0x28, 0xca, 0x30, 0xb1, 0x80,
            0x81, 0xeb, 0xfd, 0xf9, 0xfa, 0x39, 0x7d, 0xe8,
        ],
        Ok(Packet {
            version: 1,
            diag: 0,
            state: State::Up,
            flags: PacketFlags::A,
            detect_mult: 3,
            my_discr: 0x11111111,
            your_discr: 0x22222222,
            desired_min_tx: 100000,
            req_min_rx: 100000,
            req_min_echo_rx: 0,
            auth: Some(AuthTlv::CryptographicSeq {
                auth_type: AuthenticationType::KeyedMd5,
                key_id: 1,
                seq: 5,
                digest: vec![
                    0xa6, 0x38, 0x73, 0x28, 0xca, 0x30, 0xb1, 0x80, 0x81,
                    0xeb, 0xfd, 0xf9, 0xfa, 0x39, 0x7d, 0xe8,
                ],
            }),
        }),
    )
});

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, packet, None);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_encode_packet(bytes, packet, None);
}

#[test]
fn test_decode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet3() {
    let (ref bytes, ref packet) = *PACKET3;
    let key = Key::new(1, CryptoAlgo::ClearText, b"secret".to_vec());
    let auth = AuthCtx {
        auth_type: AuthenticationType::SimplePassword,
        key: &key,
        seq: 0,
    };
    test_encode_packet(bytes, packet, Some(&auth));
}

#[test]
fn test_decode_packet3() {
    let (ref bytes, ref packet) = *PACKET3;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet4() {
    let (ref bytes, ref packet) = *PACKET4;
    let key = Key::new(1, CryptoAlgo::Md5, b"foobar".to_vec());
    let auth = AuthCtx {
        auth_type: AuthenticationType::KeyedMd5,
        key: &key,
        seq: 5,
    };
    test_encode_packet(bytes, packet, Some(&auth));
}

#[test]
fn test_decode_packet4() {
    let (ref bytes, ref packet) = *PACKET4;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_verify_auth() {
    let (ref bytes, ref packet) = *PACKET4;
    let packet = packet.as_ref().unwrap();
    let tlv = packet.auth.as_ref().unwrap();

    let key = Key::new(1, CryptoAlgo::Md5, b"foobar".to_vec());
    assert!(Packet::verify_auth(
        bytes,
        tlv,
        AuthenticationType::KeyedMd5,
        &key
    ));

    // Wrong shared key.
    let bad_key = Key::new(1, CryptoAlgo::Md5, b"foobaz".to_vec());
    assert!(!Packet::verify_auth(
        bytes,
        tlv,
        AuthenticationType::KeyedMd5,
        &bad_key
    ));

    // Wrong key ID.
    let bad_key = Key::new(2, CryptoAlgo::Md5, b"foobar".to_vec());
    assert!(!Packet::verify_auth(
        bytes,
        tlv,
        AuthenticationType::KeyedMd5,
        &bad_key
    ));

    // Tampered packet.
    let mut tampered = bytes.clone();
    tampered[4] ^= 0xff;
    assert!(!Packet::verify_auth(
        &tampered,
        tlv,
        AuthenticationType::KeyedMd5,
        &key
    ));
}

#[test]
fn test_decode_malformed() {
    // Truncated packet.
    assert_eq!(
        Packet::decode(&[0x20, 0xc0, 0x03]),
        Err(DecodeError::IncompletePacket)
    );

    // Invalid version.
    let (ref bytes, _) = *PACKET1;
    let mut bad = bytes.clone();
    bad[0] = 0x40;
    assert_eq!(Packet::decode(&bad), Err(DecodeError::InvalidVersion(2)));

    // Zero detection multiplier.
    let mut bad = bytes.clone();
    bad[2] = 0;
    assert_eq!(Packet::decode(&bad), Err(DecodeError::InvalidDetectMult(0)));

    // Zero My Discriminator.
    let mut bad = bytes.clone();
    bad[4..8].copy_from_slice(&[0; 4]);
    assert_eq!(
        Packet::decode(&bad),
        Err(DecodeError::InvalidMyDiscriminator(0))
    );

    // M-bit set.
    let mut bad = bytes.clone();
    bad[1] |= 0x01;
    assert_eq!(
        Packet::decode(&bad),
        Err(DecodeError::InvalidFlags(
            PacketFlags::from_bits_truncate(0x01)
        ))
    );
}
