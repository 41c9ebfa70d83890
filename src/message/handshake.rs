use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::{ClientHello, ClientKeyExchange, Finished, HelloVerifyRequest};
use super::{ServerHello, ServerKeyExchange};
use crate::buffer::Buf;
use crate::util::be_u24;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    ServerKeyExchange,
    ServerHelloDone,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            3 => HandshakeType::HelloVerifyRequest,
            12 => HandshakeType::ServerKeyExchange,
            14 => HandshakeType::ServerHelloDone,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            _ => HandshakeType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            HandshakeType::HelloRequest => 0,
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::HelloVerifyRequest => 3,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
            HandshakeType::Unknown(value) => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    HelloRequest,
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    HelloVerifyRequest(HelloVerifyRequest),
    ServerKeyExchange(ServerKeyExchange),
    ServerHelloDone,
    ClientKeyExchange(ClientKeyExchange),
    Finished(Finished),
}

impl Body {
    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            Body::HelloRequest => HandshakeType::HelloRequest,
            Body::ClientHello(_) => HandshakeType::ClientHello,
            Body::ServerHello(_) => HandshakeType::ServerHello,
            Body::HelloVerifyRequest(_) => HandshakeType::HelloVerifyRequest,
            Body::ServerKeyExchange(_) => HandshakeType::ServerKeyExchange,
            Body::ServerHelloDone => HandshakeType::ServerHelloDone,
            Body::ClientKeyExchange(_) => HandshakeType::ClientKeyExchange,
            Body::Finished(_) => HandshakeType::Finished,
        }
    }

    fn parse(msg_type: HandshakeType, input: &[u8]) -> IResult<&[u8], Body> {
        match msg_type {
            HandshakeType::HelloRequest => Ok((input, Body::HelloRequest)),
            HandshakeType::ClientHello => {
                let (input, v) = ClientHello::parse(input)?;
                Ok((input, Body::ClientHello(v)))
            }
            HandshakeType::ServerHello => {
                let (input, v) = ServerHello::parse(input)?;
                Ok((input, Body::ServerHello(v)))
            }
            HandshakeType::HelloVerifyRequest => {
                let (input, v) = HelloVerifyRequest::parse(input)?;
                Ok((input, Body::HelloVerifyRequest(v)))
            }
            HandshakeType::ServerKeyExchange => {
                let (input, v) = ServerKeyExchange::parse(input)?;
                Ok((input, Body::ServerKeyExchange(v)))
            }
            HandshakeType::ServerHelloDone => Ok((input, Body::ServerHelloDone)),
            HandshakeType::ClientKeyExchange => {
                let (input, v) = ClientKeyExchange::parse(input)?;
                Ok((input, Body::ClientKeyExchange(v)))
            }
            HandshakeType::Finished => {
                let (input, v) = Finished::parse(input)?;
                Ok((input, Body::Finished(v)))
            }
            HandshakeType::Unknown(_) => Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Switch,
            ))),
        }
    }

    fn serialize(&self, output: &mut Buf) {
        match self {
            Body::HelloRequest | Body::ServerHelloDone => {}
            Body::ClientHello(v) => v.serialize(output),
            Body::ServerHello(v) => v.serialize(output),
            Body::HelloVerifyRequest(v) => v.serialize(output),
            Body::ServerKeyExchange(v) => v.serialize(output),
            Body::ClientKeyExchange(v) => v.serialize(output),
            Body::Finished(v) => v.serialize(output),
        }
    }
}

/// A complete, unfragmented handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub message_seq: u16,
    pub body: Body,
}

impl HandshakeMessage {
    /// msg_type(1) + length(3) + message_seq(2) + fragment_offset(3) + fragment_length(3)
    pub const HEADER_LEN: usize = 12;

    pub fn new(message_seq: u16, body: Body) -> Self {
        HandshakeMessage { message_seq, body }
    }

    pub fn handshake_type(&self) -> HandshakeType {
        self.body.handshake_type()
    }

    /// Parse the single handshake message carried by a record fragment.
    ///
    /// Fragmented messages and trailing data are rejected.
    pub fn parse(fragment: &[u8]) -> Result<HandshakeMessage, Error> {
        let (rest, message) =
            Self::parse_inner(fragment).map_err(|e| Error::Parse(format!("{:?}", e)))?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{} trailing bytes after handshake message",
                rest.len()
            )));
        }
        Ok(message)
    }

    fn parse_inner(input: &[u8]) -> IResult<&[u8], HandshakeMessage> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        if fragment_offset != 0 || fragment_length != length {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }

        let (rest, body_bytes) = take(length as usize)(input)?;
        let (body_rest, body) = Body::parse(HandshakeType::from_u8(msg_type), body_bytes)?;
        if !body_rest.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                body_rest,
                nom::error::ErrorKind::Eof,
            )));
        }

        Ok((rest, HandshakeMessage { message_seq, body }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        let mut body = Buf::new();
        self.body.serialize(&mut body);

        output.push(self.handshake_type().as_u8());
        output.push_u24(body.len() as u32);
        output.push_u16(self.message_seq);
        output.push_u24(0);
        output.push_u24(body.len() as u32);
        output.extend_from_slice(&body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buf::new();
        self.serialize(&mut buf);
        buf.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_request_roundtrip() {
        let message = HandshakeMessage::new(3, Body::HelloRequest);
        let bytes = message.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0]);
        assert_eq!(HandshakeMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn rejects_fragments() {
        let mut bytes = HandshakeMessage::new(0, Body::ServerHelloDone).to_bytes();
        // Claim a fragment offset of 1
        bytes[8] = 1;
        assert!(HandshakeMessage::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_data() {
        let mut bytes = HandshakeMessage::new(0, Body::ServerHelloDone).to_bytes();
        bytes.push(0);
        assert!(HandshakeMessage::parse(&bytes).is_err());
    }
}
