//! Growable byte buffer used by all serializers.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Newtype around `Vec<u8>` that the message serializers write into.
///
/// The `Debug` impl only shows the length so that key material and
/// application payloads never end up in logs.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Buf(Vec<u8>);

impl Buf {
    /// Create a new empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new buffer from a slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Buf(data.to_vec())
    }

    /// Clear the buffer, removing all data.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Extend the buffer with a slice of bytes.
    pub fn extend_from_slice(&mut self, other: &[u8]) {
        self.0.extend_from_slice(other);
    }

    /// Push a single byte onto the buffer.
    pub fn push(&mut self, byte: u8) {
        self.0.push(byte);
    }

    /// Append a big endian u16.
    pub fn push_u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    /// Append the low 24 bits of `value`, big endian.
    pub fn push_u24(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_be_bytes()[1..]);
    }

    /// Append the low 48 bits of `value`, big endian.
    pub fn push_u48(&mut self, value: u64) {
        self.0.extend_from_slice(&value.to_be_bytes()[2..]);
    }

    /// Append `data` prefixed by a one byte length.
    pub fn push_vec8(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u8::MAX as usize);
        self.0.push(data.len() as u8);
        self.0.extend_from_slice(data);
    }

    /// Append `data` prefixed by a two byte length.
    pub fn push_vec16(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.push_u16(data.len() as u16);
        self.0.extend_from_slice(data);
    }

    /// Convert the buffer into the underlying `Vec<u8>`.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf").field("len", &self.0.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_big_endian_integers() {
        let mut buf = Buf::new();
        buf.push_u16(0x0102);
        buf.push_u24(0x030405);
        buf.push_u48(0x060708090A0B);
        assert_eq!(
            &*buf,
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B]
        );
    }

    #[test]
    fn length_prefixed() {
        let mut buf = Buf::new();
        buf.push_vec8(&[0xAA]);
        buf.push_vec16(&[0xBB, 0xCC]);
        assert_eq!(&*buf, &[0x01, 0xAA, 0x00, 0x02, 0xBB, 0xCC]);
    }
}
