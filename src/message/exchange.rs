//! ECDHE_PSK key exchange messages (RFC 5489) and Finished.

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;

const CURVE_TYPE_NAMED: u8 = 3;

/// IANA named group for x25519.
pub const NAMED_CURVE_X25519: u16 = 29;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub psk_identity_hint: Vec<u8>,
    pub named_curve: u16,
    pub public_key: Vec<u8>,
}

impl ServerKeyExchange {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerKeyExchange> {
        let (input, hint_len) = be_u16(input)?;
        let (input, hint) = take(hint_len as usize)(input)?;
        let (input, curve_type) = be_u8(input)?;
        if curve_type != CURVE_TYPE_NAMED {
            return Err(Err::Failure(Error::new(input, ErrorKind::Tag)));
        }
        let (input, named_curve) = be_u16(input)?;
        let (input, key_len) = be_u8(input)?;
        let (input, public_key) = take(key_len as usize)(input)?;

        Ok((
            input,
            ServerKeyExchange {
                psk_identity_hint: hint.to_vec(),
                named_curve,
                public_key: public_key.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push_vec16(&self.psk_identity_hint);
        output.push(CURVE_TYPE_NAMED);
        output.push_u16(self.named_curve);
        output.push_vec8(&self.public_key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub psk_identity: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl ClientKeyExchange {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientKeyExchange> {
        let (input, identity_len) = be_u16(input)?;
        let (input, identity) = take(identity_len as usize)(input)?;
        let (input, key_len) = be_u8(input)?;
        let (input, public_key) = take(key_len as usize)(input)?;

        Ok((
            input,
            ClientKeyExchange {
                psk_identity: identity.to_vec(),
                public_key: public_key.to_vec(),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push_vec16(&self.psk_identity);
        output.push_vec8(&self.public_key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: [u8; 12],
}

impl Finished {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Finished> {
        let (input, data) = take(12_usize)(input)?;
        let mut verify_data = [0; 12];
        verify_data.copy_from_slice(data);
        Ok((input, Finished { verify_data }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.verify_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_key_exchange_wire_format() {
        let ske = ServerKeyExchange {
            psk_identity_hint: vec![],
            named_curve: NAMED_CURVE_X25519,
            public_key: vec![9; 32],
        };
        let mut buf = Buf::new();
        ske.serialize(&mut buf);
        assert_eq!(&buf[..6], &[0, 0, 3, 0, 29, 32]);
        assert_eq!(ServerKeyExchange::parse(&buf).unwrap().1, ske);
    }

    #[test]
    fn server_key_exchange_rejects_explicit_curves() {
        let input = [0, 0, 1, 0, 29, 0];
        assert!(ServerKeyExchange::parse(&input).is_err());
    }

    #[test]
    fn client_key_exchange_carries_identity() {
        let cke = ClientKeyExchange {
            psk_identity: b"client1".to_vec(),
            public_key: vec![1; 32],
        };
        let mut buf = Buf::new();
        cke.serialize(&mut buf);
        assert_eq!(&buf[..2], &[0, 7]);
        assert_eq!(ClientKeyExchange::parse(&buf).unwrap().1, cke);
    }
}
