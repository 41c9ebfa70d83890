use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use crate::buffer::Buf;
use crate::rng::SeededRng;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InvalidLength(&'static str, usize, usize, usize);

impl fmt::Debug for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for InvalidLength {}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incorrect variable ID ({}) length: {} <= {} <= {}",
            self.0, self.1, self.2, self.3,
        )
    }
}

/// Opaque byte vectors with a one byte length prefix on the wire.
macro_rules! var_array {
    ($name:ident, $min:expr, $max:expr) => {
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub const EMPTY: $name = $name([0; $max], 0);

            pub fn try_new(data: &[u8]) -> Result<Self, InvalidLength> {
                #[allow(unused_comparisons)]
                if data.len() < $min || data.len() > $max {
                    return Err(InvalidLength(stringify!($name), $min, data.len(), $max));
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok($name(array, data.len()))
            }

            pub fn random(len: usize, rng: &mut SeededRng) -> $name {
                let len = len.clamp($min, $max);
                let mut arr = [0; $max];
                rng.fill(&mut arr[..len]);
                Self(arr, len)
            }

            pub fn is_empty(&self) -> bool {
                self.1 == 0
            }

            pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, len) = be_u8(input)?;
                #[allow(unused_comparisons)]
                if (len as usize) < $min || (len as usize) > $max {
                    return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
                }
                let (input, data) = take(len as usize)(input)?;
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok((input, $name(array, data.len())))
            }

            pub fn serialize(&self, output: &mut Buf) {
                output.push_vec8(self);
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                **self == **other
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                (**self).hash(state);
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::EMPTY
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for b in self.iter() {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    };
}

var_array!(SessionId, 0, 32);
var_array!(Cookie, 0, 255);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_bounds() {
        assert!(SessionId::try_new(&[0; 32]).is_ok());
        assert!(SessionId::try_new(&[0; 33]).is_err());
        assert!(SessionId::try_new(&[]).unwrap().is_empty());
    }

    #[test]
    fn equality_ignores_unused_tail() {
        let a = SessionId::try_new(&[1, 2, 3]).unwrap();
        let b = SessionId::try_new(&[1, 2, 3]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, SessionId::try_new(&[1, 2]).unwrap());
    }

    #[test]
    fn parse_rejects_overlong_session_id() {
        let mut input = vec![33];
        input.extend_from_slice(&[0; 33]);
        assert!(SessionId::parse(&input).is_err());
    }
}
