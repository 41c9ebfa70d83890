//! Wire types of the DTLS 1.2 record and handshake layers.
//!
//! Only the subset needed by the connector is modelled: the records
//! themselves, the handshake messages of the ECDHE_PSK flow, and alerts.

mod alert;
mod exchange;
mod handshake;
mod hello;
mod id;
mod record;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use exchange::{ClientKeyExchange, Finished, ServerKeyExchange, NAMED_CURVE_X25519};
pub use handshake::{Body, HandshakeMessage, HandshakeType};
pub use hello::{ClientHello, HelloVerifyRequest, ServerHello};
pub use id::{Cookie, SessionId};
pub use record::Record;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::buffer::Buf;
use crate::rng::SeededRng;

/// Largest plaintext fragment a record may carry (2^14).
pub const MAX_PLAINTEXT_FRAGMENT_LENGTH: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    DTLS1_0,
    DTLS1_2,
    Unknown(u16),
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ProtocolVersion {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::DTLS1_0 => 0xFEFF,
            ProtocolVersion::DTLS1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => *value,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::DTLS1_0,
            0xFEFD => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, version) = be_u16(input)?;
        Ok((input, Self::from_u16(version)))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push_u16(self.as_u16());
    }
}

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum CipherSuite {
    /// TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256 (RFC 8442)
    ECDHE_PSK_AES128_GCM_SHA256, // 0xD001
    Unknown(u16),
}

impl CipherSuite {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xD001 => CipherSuite::ECDHE_PSK_AES128_GCM_SHA256,
            _ => CipherSuite::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CipherSuite::ECDHE_PSK_AES128_GCM_SHA256 => 0xD001,
            CipherSuite::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CipherSuite> {
        let (input, value) = be_u16(input)?;
        Ok((input, Self::from_u16(value)))
    }
}

/// The 32 byte hello random.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Random(pub [u8; 32]);

impl Random {
    pub fn new(rng: &mut SeededRng) -> Self {
        let mut bytes = [0; 32];
        rng.fill(&mut bytes);
        Random(bytes)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Random> {
        let (input, data) = take(32_usize)(input)?;
        let mut bytes = [0; 32];
        bytes.copy_from_slice(data);
        Ok((input, Random(bytes)))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.0);
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Random({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Maximum fragment length extension values (RFC 6066).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaxFragmentLength {
    Bytes512,
    Bytes1024,
    Bytes2048,
    Bytes4096,
}

impl MaxFragmentLength {
    pub const EXTENSION_TYPE: u16 = 1;

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MaxFragmentLength::Bytes512),
            2 => Some(MaxFragmentLength::Bytes1024),
            3 => Some(MaxFragmentLength::Bytes2048),
            4 => Some(MaxFragmentLength::Bytes4096),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            MaxFragmentLength::Bytes512 => 1,
            MaxFragmentLength::Bytes1024 => 2,
            MaxFragmentLength::Bytes2048 => 3,
            MaxFragmentLength::Bytes4096 => 4,
        }
    }

    /// The negotiated plaintext limit in bytes.
    pub fn length(&self) -> usize {
        match self {
            MaxFragmentLength::Bytes512 => 512,
            MaxFragmentLength::Bytes1024 => 1024,
            MaxFragmentLength::Bytes2048 => 2048,
            MaxFragmentLength::Bytes4096 => 4096,
        }
    }
}

/// The only compression method DTLS 1.2 allows.
pub const COMPRESSION_NULL: u8 = 0;
