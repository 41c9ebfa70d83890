use std::ops::RangeFrom;

use nom::error::{make_error, ErrorKind, ParseError};
use nom::{Err, IResult, InputIter, InputLength, Slice};

fn be_uint<I, E: ParseError<I>>(input: I, bound: usize) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u64;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u64;
        }

        Ok((input.slice(bound..), res))
    }
}

/// Handshake lengths and fragment offsets are 24 bit.
pub fn be_u24<I, E: ParseError<I>>(input: I) -> IResult<I, u32, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let (rest, value) = be_uint(input, 3)?;
    Ok((rest, value as u32))
}

/// Record sequence numbers are 48 bit.
pub fn be_u48<I, E: ParseError<I>>(input: I) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    be_uint(input, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_u24_and_u48() {
        let input: &[u8] = &[0x01, 0x02, 0x03, 0xFF];
        let (rest, v) = be_u24::<_, nom::error::Error<_>>(input).unwrap();
        assert_eq!(v, 0x010203);
        assert_eq!(rest, &[0xFF]);

        let input: &[u8] = &[0, 0, 0, 0, 1, 0];
        let (rest, v) = be_u48::<_, nom::error::Error<_>>(input).unwrap();
        assert_eq!(v, 256);
        assert!(rest.is_empty());
    }

    #[test]
    fn too_short() {
        let input: &[u8] = &[0x01, 0x02];
        assert!(be_u24::<_, nom::error::Error<_>>(input).is_err());
    }
}
