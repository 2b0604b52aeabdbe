//
// Copyright (c) The Bfdd Project Developers
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::State;
use bfdd_utils::bytes::TLS_BUF;
use bfdd_utils::keychain::Key;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use md5::{Digest, Md5};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use sha1::Sha1;

//
// Generic BFD Control Packet Format.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       My Discriminator                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                      Your Discriminator                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Desired Min TX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                   Required Min RX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Required Min Echo RX Interval                 |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// An optional authentication section may follow the mandatory section.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Packet {
    pub version: u8,
    pub diag: u8,
    pub state: State,
    pub flags: PacketFlags,
    pub detect_mult: u8,
    pub my_discr: u32,
    pub your_discr: u32,
    pub desired_min_tx: u32,
    pub req_min_rx: u32,
    pub req_min_echo_rx: u32,
    pub auth: Option<AuthTlv>,
}

// Decoded authentication section.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AuthTlv {
    SimplePassword {
        key_id: u8,
        password: Vec<u8>,
    },
    CryptographicSeq {
        auth_type: AuthenticationType,
        key_id: u8,
        seq: u32,
        digest: Vec<u8>,
    },
}

// Parameters used to authenticate an outgoing packet.
#[derive(Debug)]
pub struct AuthCtx<'a> {
    pub auth_type: AuthenticationType,
    pub key: &'a Key,
    pub seq: u32,
}

// BFD Diagnostic Codes.
//
// IANA registry:
// https://www.iana.org/assignments/bfd-parameters/bfd-parameters.xhtml#bfd-parameters-1
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DiagnosticCode {
    Nothing = 0,
    TimeExpired = 1,
    EchoFailed = 2,
    NbrDown = 3,
    FwdPlaneReset = 4,
    PathDown = 5,
    ConcatPathDown = 6,
    AdminDown = 7,
    RevConcatPathDown = 8,
    MisConnectivity = 9,
}

// BFD Authentication Types.
//
// IANA registry:
// https://www.iana.org/assignments/bfd-parameters/bfd-parameters.xhtml#bfd-parameters-2
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AuthenticationType {
    SimplePassword = 1,
    KeyedMd5 = 2,
    MeticulousKeyedMd5 = 3,
    KeyedSha1 = 4,
    MeticulousKeyedSha1 = 5,
}

// BFD packet flags.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct PacketFlags: u8 {
        const P = 1 << 5;
        const F = 1 << 4;
        const C = 1 << 3;
        const A = 1 << 2;
        const D = 1 << 1;
        const M = 1 << 0;
    }
}

// BFD decode errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    IncompletePacket,
    InvalidVersion(u8),
    InvalidPacketLength(u8),
    InvalidAuthenticationLength(u8),
    InvalidDetectMult(u8),
    InvalidMyDiscriminator(u32),
    InvalidFlags(PacketFlags),
    InvalidAuthenticationType(u8),
    ReadOutOfBounds,
}

// ===== impl Packet =====

impl Packet {
    pub const VERSION: u8 = 1;
    pub const MANDATORY_SECTION_LEN: u8 = 24;
    // Length of the header preceding the Auth Key/Digest field in the keyed
    // authentication schemes.
    const AUTH_CRYPTO_HDR_LEN: u8 = 8;

    // Encodes BFD packet into a bytes buffer.
    //
    // When an authentication context is given, the corresponding
    // authentication section is appended and the A-bit is set.
    pub fn encode(&self, auth: Option<&AuthCtx<'_>>) -> BytesMut {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            let mut flags = self.flags;
            if auth.is_some() {
                flags.insert(PacketFlags::A);
            }

            buf.put_u8((self.version << 5) | self.diag);
            buf.put_u8(((self.state as u8) << 6) | flags.bits());
            buf.put_u8(self.detect_mult);
            // The length will be initialized later.
            buf.put_u8(0);
            buf.put_u32(self.my_discr);
            buf.put_u32(self.your_discr);
            buf.put_u32(self.desired_min_tx);
            buf.put_u32(self.req_min_rx);
            buf.put_u32(self.req_min_echo_rx);

            let mut digest_offset = None;
            if let Some(auth) = auth {
                match auth.auth_type {
                    AuthenticationType::SimplePassword => {
                        let password = &auth.key.string;
                        buf.put_u8(AuthenticationType::SimplePassword as u8);
                        buf.put_u8(3 + password.len() as u8);
                        buf.put_u8(auth.key.id);
                        buf.put_slice(password);
                    }
                    _ => {
                        let digest_size = auth_digest_size(auth.auth_type);
                        buf.put_u8(auth.auth_type as u8);
                        buf.put_u8(Self::AUTH_CRYPTO_HDR_LEN + digest_size);
                        buf.put_u8(auth.key.id);
                        buf.put_u8(0);
                        buf.put_u32(auth.seq);
                        // The digest is calculated over the entire packet
                        // with the shared key filling the Auth Key/Digest
                        // field, padded with trailing zeroes (RFC 5880,
                        // sections 6.7.3 and 6.7.4).
                        digest_offset = Some(buf.len());
                        buf.put_slice(&padded_key(
                            &auth.key.string,
                            digest_size as usize,
                        ));
                    }
                }
            }

            // Initialize packet length.
            buf[3] = buf.len() as u8;

            if let (Some(offset), Some(auth)) = (digest_offset, auth) {
                let digest = packet_digest(auth.auth_type, &buf);
                buf[offset..offset + digest.len()].copy_from_slice(&digest);
            }

            buf.clone()
        })
    }

    // Decodes BFD packet from a bytes buffer.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(data);

        // Validate the packet length.
        if data.len() < Self::MANDATORY_SECTION_LEN as _ {
            return Err(DecodeError::IncompletePacket);
        }

        let first_byte = buf.try_get_u8()?;
        let sec_byte = buf.try_get_u8()?;
        let version = first_byte >> 5;
        if version != Self::VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let diag = first_byte & 0x1F;
        let state = State::from_u8(sec_byte >> 6).unwrap();
        let flags = PacketFlags::from_bits_truncate(sec_byte & 0x3F);
        let detect_mult = buf.try_get_u8()?;
        let length = buf.try_get_u8()?;
        if flags.contains(PacketFlags::A) {
            if length < Self::MANDATORY_SECTION_LEN + 2 {
                return Err(DecodeError::InvalidPacketLength(length));
            }
        } else if length != Self::MANDATORY_SECTION_LEN {
            return Err(DecodeError::InvalidPacketLength(length));
        }
        if length as usize > data.len() {
            return Err(DecodeError::InvalidPacketLength(length));
        }
        if detect_mult == 0 {
            return Err(DecodeError::InvalidDetectMult(detect_mult));
        }
        if flags.contains(PacketFlags::M) {
            return Err(DecodeError::InvalidFlags(flags));
        }
        let my_discr = buf.try_get_u32()?;
        if my_discr == 0 {
            return Err(DecodeError::InvalidMyDiscriminator(my_discr));
        }
        let your_discr = buf.try_get_u32()?;
        let desired_min_tx = buf.try_get_u32()?;
        let req_min_rx = buf.try_get_u32()?;
        let req_min_echo_rx = buf.try_get_u32()?;

        // Optional authentication section.
        let mut auth = None;
        if flags.contains(PacketFlags::A) {
            let auth_type = buf.try_get_u8()?;
            let auth_len = buf.try_get_u8()?;
            if auth_len as usize + Self::MANDATORY_SECTION_LEN as usize
                > length as usize
            {
                return Err(DecodeError::InvalidAuthenticationLength(auth_len));
            }
            let Some(auth_type) = AuthenticationType::from_u8(auth_type) else {
                return Err(DecodeError::InvalidAuthenticationType(auth_type));
            };
            match auth_type {
                AuthenticationType::SimplePassword => {
                    if auth_len < 4 || auth_len > 19 {
                        return Err(DecodeError::InvalidAuthenticationLength(
                            auth_len,
                        ));
                    }
                    let key_id = buf.try_get_u8()?;
                    let mut password = vec![0; auth_len as usize - 3];
                    buf.try_copy_to_slice(&mut password)?;
                    auth = Some(AuthTlv::SimplePassword { key_id, password });
                }
                AuthenticationType::KeyedMd5
                | AuthenticationType::MeticulousKeyedMd5
                | AuthenticationType::KeyedSha1
                | AuthenticationType::MeticulousKeyedSha1 => {
                    let digest_size = auth_digest_size(auth_type);
                    if auth_len != Self::AUTH_CRYPTO_HDR_LEN + digest_size {
                        return Err(DecodeError::InvalidAuthenticationLength(
                            auth_len,
                        ));
                    }
                    let key_id = buf.try_get_u8()?;
                    let _reserved = buf.try_get_u8()?;
                    let seq = buf.try_get_u32()?;
                    let mut digest = vec![0; digest_size as usize];
                    buf.try_copy_to_slice(&mut digest)?;
                    auth = Some(AuthTlv::CryptographicSeq {
                        auth_type,
                        key_id,
                        seq,
                        digest,
                    });
                }
            }
        }
        let packet = Packet {
            version,
            diag,
            state,
            flags,
            detect_mult,
            my_discr,
            your_discr,
            desired_min_tx,
            req_min_rx,
            req_min_echo_rx,
            auth,
        };

        Ok(packet)
    }

    // Verifies the authentication digest or password of a received packet.
    //
    // `data` must contain the original packet bytes the authentication
    // section was computed over.
    pub fn verify_auth(
        data: &[u8],
        tlv: &AuthTlv,
        auth_type: AuthenticationType,
        key: &Key,
    ) -> bool {
        match tlv {
            AuthTlv::SimplePassword { key_id, password } => {
                auth_type == AuthenticationType::SimplePassword
                    && *key_id == key.id
                    && *password == key.string
            }
            AuthTlv::CryptographicSeq {
                auth_type: pkt_auth_type,
                key_id,
                digest,
                ..
            } => {
                if *pkt_auth_type != auth_type || *key_id != key.id {
                    return false;
                }

                // Recompute the digest with the Auth Key/Digest field
                // replaced by the padded shared key.
                let length = data[3] as usize;
                let offset = (Self::MANDATORY_SECTION_LEN
                    + Self::AUTH_CRYPTO_HDR_LEN)
                    as usize;
                if length > data.len() || length < offset + digest.len() {
                    return false;
                }
                let mut buf = data[..length].to_vec();
                buf[offset..offset + digest.len()]
                    .copy_from_slice(&padded_key(&key.string, digest.len()));
                packet_digest(auth_type, &buf) == *digest
            }
        }
    }
}

// ===== impl AuthTlv =====

impl AuthTlv {
    pub fn key_id(&self) -> u8 {
        match self {
            AuthTlv::SimplePassword { key_id, .. }
            | AuthTlv::CryptographicSeq { key_id, .. } => *key_id,
        }
    }

    pub fn seq(&self) -> Option<u32> {
        match self {
            AuthTlv::SimplePassword { .. } => None,
            AuthTlv::CryptographicSeq { seq, .. } => Some(*seq),
        }
    }
}

// ===== impl AuthenticationType =====

impl AuthenticationType {
    // Meticulous schemes require the sequence number to increment with every
    // transmitted packet.
    pub fn is_meticulous(&self) -> bool {
        matches!(
            self,
            AuthenticationType::MeticulousKeyedMd5
                | AuthenticationType::MeticulousKeyedSha1
        )
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::IncompletePacket => {
                write!(f, "Incomplete packet")
            }
            DecodeError::InvalidVersion(version) => {
                write!(f, "Invalid BFD version: {version}")
            }
            DecodeError::InvalidPacketLength(len) => {
                write!(f, "Invalid packet length: {len}")
            }
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            DecodeError::InvalidDetectMult(detect_mult) => {
                write!(f, "Invalid Detect Mult: {detect_mult}")
            }
            DecodeError::InvalidMyDiscriminator(my_discr) => {
                write!(f, "Invalid My Discriminator: {my_discr}")
            }
            DecodeError::InvalidFlags(flags) => {
                write!(f, "Invalid Flags: {flags:?}")
            }
            DecodeError::InvalidAuthenticationType(auth_type) => {
                write!(f, "Invalid Authentication Type: {auth_type}")
            }
            DecodeError::InvalidAuthenticationLength(auth_len) => {
                write!(f, "Invalid Authentication Length: {auth_len}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}

// ===== helper functions =====

fn auth_digest_size(auth_type: AuthenticationType) -> u8 {
    match auth_type {
        AuthenticationType::SimplePassword => unreachable!(),
        AuthenticationType::KeyedMd5
        | AuthenticationType::MeticulousKeyedMd5 => 16,
        AuthenticationType::KeyedSha1
        | AuthenticationType::MeticulousKeyedSha1 => 20,
    }
}

fn padded_key(key: &[u8], size: usize) -> Vec<u8> {
    let mut padded = vec![0; size];
    let len = std::cmp::min(key.len(), size);
    padded[..len].copy_from_slice(&key[..len]);
    padded
}

fn packet_digest(auth_type: AuthenticationType, data: &[u8]) -> Vec<u8> {
    match auth_type {
        AuthenticationType::SimplePassword => unreachable!(),
        AuthenticationType::KeyedMd5
        | AuthenticationType::MeticulousKeyedMd5 => {
            Md5::digest(data).to_vec()
        }
        AuthenticationType::KeyedSha1
        | AuthenticationType::MeticulousKeyedSha1 => {
            Sha1::digest(data).to_vec()
        }
    }
}
