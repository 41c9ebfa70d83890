use nom::bytes::complete::take;
use nom::multi::many0;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::{CipherSuite, Cookie, MaxFragmentLength, ProtocolVersion, Random, SessionId};
use crate::buffer::Buf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<u8>,
    pub max_fragment_length: Option<MaxFragmentLength>,
}

impl ClientHello {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;
        let (input, suites_len) = be_u16(input)?;
        let (input, suites) = take(suites_len as usize)(input)?;
        let (_, cipher_suites) = many0(CipherSuite::parse)(suites)?;
        let (input, compression_len) = be_u8(input)?;
        let (input, compression) = take(compression_len as usize)(input)?;
        let (input, max_fragment_length) = parse_extensions(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods: compression.to_vec(),
                max_fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);
        output.push_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            output.push_u16(suite.as_u16());
        }
        output.push_vec8(&self.compression_methods);
        serialize_extensions(self.max_fragment_length, output);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;
        Ok((
            input,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    pub max_fragment_length: Option<MaxFragmentLength>,
}

impl ServerHello {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = be_u8(input)?;
        let (input, max_fragment_length) = parse_extensions(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                compression_method,
                max_fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.push_u16(self.cipher_suite.as_u16());
        output.push(self.compression_method);
        serialize_extensions(self.max_fragment_length, output);
    }
}

/// Parse the optional extensions block, keeping only max_fragment_length.
fn parse_extensions(input: &[u8]) -> IResult<&[u8], Option<MaxFragmentLength>> {
    if input.is_empty() {
        return Ok((input, None));
    }

    let (input, total) = be_u16(input)?;
    let (input, mut extensions) = take(total as usize)(input)?;

    let mut max_fragment_length = None;
    while !extensions.is_empty() {
        let (rest, extension_type) = be_u16(extensions)?;
        let (rest, len) = be_u16(rest)?;
        let (rest, data) = take(len as usize)(rest)?;
        if extension_type == MaxFragmentLength::EXTENSION_TYPE && data.len() == 1 {
            max_fragment_length = MaxFragmentLength::from_code(data[0]);
        } else {
            trace!("Ignoring extension type {}", extension_type);
        }
        extensions = rest;
    }

    Ok((input, max_fragment_length))
}

fn serialize_extensions(max_fragment_length: Option<MaxFragmentLength>, output: &mut Buf) {
    if let Some(mfl) = max_fragment_length {
        output.push_u16(5);
        output.push_u16(MaxFragmentLength::EXTENSION_TYPE);
        output.push_vec16(&[mfl.code()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::COMPRESSION_NULL;

    fn client_hello() -> ClientHello {
        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random: Random([7; 32]),
            session_id: SessionId::try_new(&[1, 2, 3]).unwrap(),
            cookie: Cookie::EMPTY,
            cipher_suites: vec![
                CipherSuite::ECDHE_PSK_AES128_GCM_SHA256,
                CipherSuite::Unknown(0xC02B),
            ],
            compression_methods: vec![COMPRESSION_NULL],
            max_fragment_length: Some(MaxFragmentLength::Bytes1024),
        }
    }

    #[test]
    fn client_hello_roundtrip() {
        let hello = client_hello();
        let mut buf = Buf::new();
        hello.serialize(&mut buf);
        let (rest, parsed) = ClientHello::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hello);
    }

    #[test]
    fn client_hello_without_extensions() {
        let mut hello = client_hello();
        hello.max_fragment_length = None;
        let mut buf = Buf::new();
        hello.serialize(&mut buf);
        let (_, parsed) = ClientHello::parse(&buf).unwrap();
        assert_eq!(parsed.max_fragment_length, None);
    }

    #[test]
    fn unknown_extensions_are_skipped() {
        let input = [0x00, 0x09, 0x00, 0x17, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03, 0xFF];
        let (rest, mfl) = parse_extensions(&input).unwrap();
        assert_eq!(mfl, Some(MaxFragmentLength::Bytes2048));
        assert_eq!(rest, &[0xFF]);
    }
}
