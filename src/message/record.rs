use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::{Err, IResult};

use super::{ContentType, HandshakeType, ProtocolVersion, MAX_PLAINTEXT_FRAGMENT_LENGTH};
use crate::buffer::Buf;
use crate::util::be_u48;

/// A single DTLS 1.2 record as read from, or written to, a datagram.
///
/// The fragment is owned so records can be handed to a worker thread
/// independently of the receive buffer they were parsed from.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub sequence_number: u64,
    pub fragment: Vec<u8>,
}

impl Record {
    /// DTLS record header length: content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
    pub const HEADER_LEN: usize = 13;

    /// Largest fragment accepted on the wire (plaintext limit plus 2048 bytes of expansion).
    pub const MAX_FRAGMENT_LEN: usize = MAX_PLAINTEXT_FRAGMENT_LENGTH + 2048;

    pub fn parse(input: &[u8]) -> IResult<&[u8], Record> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;

        // Records carrying a ClientHello may use DTLS 1.0 in the record layer.
        match version {
            ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2 => {}
            _ => {
                return Err(Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Tag,
                )));
            }
        }

        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;

        if length as usize > Self::MAX_FRAGMENT_LEN {
            return Err(Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        let (rest, fragment) = take(length as usize)(input)?;

        Ok((
            rest,
            Record {
                content_type,
                version,
                epoch,
                sequence_number,
                fragment: fragment.to_vec(),
            },
        ))
    }

    /// Split a datagram into its records.
    ///
    /// Parsing stops at the first malformed record; the records before it
    /// are still returned.
    pub fn parse_datagram(mut datagram: &[u8]) -> Vec<Record> {
        let mut records = Vec::new();
        while !datagram.is_empty() {
            match Record::parse(datagram) {
                Ok((rest, record)) => {
                    records.push(record);
                    datagram = rest;
                }
                Err(e) => {
                    debug!("Dropping malformed remainder of datagram: {:?}", e);
                    break;
                }
            }
        }
        records
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.content_type.as_u8());
        self.version.serialize(output);
        output.push_u16(self.epoch);
        output.push_u48(self.sequence_number);
        output.push_u16(self.fragment.len() as u16);
        output.extend_from_slice(&self.fragment);
    }

    /// Total length on the wire.
    pub fn wire_len(&self) -> usize {
        Self::HEADER_LEN + self.fragment.len()
    }

    /// Whether this is a plaintext record starting a new handshake.
    pub fn is_new_client_hello(&self) -> bool {
        self.epoch == 0
            && self.content_type == ContentType::Handshake
            && self.fragment.first().copied() == Some(HandshakeType::ClientHello.as_u8())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("content_type", &self.content_type)
            .field("epoch", &self.epoch)
            .field("sequence_number", &self.sequence_number)
            .field("length", &self.fragment.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = &[
        0x16, // ContentType::Handshake
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        0x00, 0x01, // epoch
        0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // sequence_number
        0x00, 0x03, // length
        0x01, 0x02, 0x03, // fragment
    ];

    #[test]
    fn roundtrip() {
        let (rest, record) = Record::parse(RECORD).unwrap();
        assert!(rest.is_empty());
        assert_eq!(record.content_type, ContentType::Handshake);
        assert_eq!(record.epoch, 1);
        assert_eq!(record.sequence_number, 1);

        let mut serialized = Buf::new();
        record.serialize(&mut serialized);
        assert_eq!(&*serialized, RECORD);
    }

    #[test]
    fn datagram_with_several_records() {
        let mut datagram = RECORD.to_vec();
        datagram.extend_from_slice(RECORD);
        // Truncated third record
        datagram.extend_from_slice(&RECORD[..7]);

        let records = Record::parse_datagram(&datagram);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bad = RECORD.to_vec();
        bad[1] = 0x03;
        bad[2] = 0x03;
        assert!(Record::parse(&bad).is_err());
    }

    #[test]
    fn detects_new_client_hello() {
        let mut record = Record::parse(RECORD).unwrap().1;
        assert!(!record.is_new_client_hello());
        record.epoch = 0;
        assert!(record.is_new_client_hello());
    }
}
