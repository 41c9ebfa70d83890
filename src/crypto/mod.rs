//! Cryptographic collaborators of the handshake and record layers.
//!
//! The record protection is pluggable through [`CipherProvider`]. Key
//! exchange (x25519), the TLS 1.2 PRF and PSK lookup are concrete.

mod aead;
mod kx;
mod prf;
mod psk;

use std::fmt;

pub use aead::Aes128GcmProvider;
pub use kx::KeyExchange;
pub use psk::{PskStore, StaticPskStore};

pub(crate) use prf::{master_secret, psk_premaster_secret, verify_data};

use crate::message::{CipherSuite, ContentType, ProtocolVersion};

/// Additional authenticated data of an AEAD protected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aad {
    pub content_type: ContentType,
    pub epoch: u16,
    pub sequence_number: u64,
}

impl Aad {
    /// seq_num(8) + type(1) + version(2) + length(2)
    pub fn to_bytes(&self, plaintext_len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..2].copy_from_slice(&self.epoch.to_be_bytes());
        aad[2..8].copy_from_slice(&self.sequence_number.to_be_bytes()[2..]);
        aad[8] = self.content_type.as_u8();
        aad[9..11].copy_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
        aad[11..].copy_from_slice(&(plaintext_len as u16).to_be_bytes());
        aad
    }

    /// The explicit nonce is epoch + sequence number.
    pub fn explicit_nonce(&self) -> [u8; 8] {
        let mut nonce = [0u8; 8];
        nonce[..2].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[2..].copy_from_slice(&self.sequence_number.to_be_bytes()[2..]);
        nonce
    }
}

/// Factory for the record protection of one cipher suite.
pub trait CipherProvider: Send + Sync + fmt::Debug {
    /// The suite this provider implements.
    fn suite(&self) -> CipherSuite;

    /// Length of (write key, fixed IV) in the key block.
    fn key_lengths(&self) -> (usize, usize);

    /// Bytes a protected fragment grows by.
    fn expansion(&self) -> usize;

    /// Create a cipher for one direction of one epoch.
    fn create_cipher(&self, key: &[u8], fixed_iv: &[u8]) -> Result<Box<dyn RecordCipher>, String>;
}

/// Protection for records in one direction.
pub trait RecordCipher: Send + fmt::Debug {
    fn seal(&self, aad: &Aad, plaintext: &[u8]) -> Result<Vec<u8>, String>;

    fn open(&self, aad: &Aad, fragment: &[u8]) -> Result<Vec<u8>, String>;
}

/// The client and server write ciphers derived from a master secret.
#[derive(Debug)]
pub(crate) struct CipherPair {
    pub client_write: Box<dyn RecordCipher>,
    pub server_write: Box<dyn RecordCipher>,
}

pub(crate) fn derive_ciphers(
    provider: &dyn CipherProvider,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<CipherPair, String> {
    let (key_len, iv_len) = provider.key_lengths();
    let block = prf::key_expansion(
        master_secret,
        client_random,
        server_random,
        2 * key_len + 2 * iv_len,
    )?;

    let (client_key, rest) = block.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, rest) = rest.split_at(iv_len);
    let server_iv = &rest[..iv_len];

    Ok(CipherPair {
        client_write: provider.create_cipher(client_key, client_iv)?,
        server_write: provider.create_cipher(server_key, server_iv)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_layout() {
        let aad = Aad {
            content_type: ContentType::ApplicationData,
            epoch: 1,
            sequence_number: 2,
        };
        assert_eq!(
            aad.to_bytes(5),
            [0, 1, 0, 0, 0, 0, 0, 2, 23, 0xFE, 0xFD, 0, 5]
        );
        assert_eq!(aad.explicit_nonce(), [0, 1, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn derived_ciphers_interoperate() {
        let provider = Aes128GcmProvider;
        let client = derive_ciphers(&provider, &[1; 48], &[2; 32], &[3; 32]).unwrap();
        let server = derive_ciphers(&provider, &[1; 48], &[2; 32], &[3; 32]).unwrap();

        let aad = Aad {
            content_type: ContentType::ApplicationData,
            epoch: 1,
            sequence_number: 0,
        };
        let sealed = client.client_write.seal(&aad, b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + provider.expansion());
        assert_eq!(server.client_write.open(&aad, &sealed).unwrap(), b"hello");

        // Directions use different keys
        assert!(server.server_write.open(&aad, &sealed).is_err());
    }
}
