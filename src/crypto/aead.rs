use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};

use super::{Aad, CipherProvider, RecordCipher};
use crate::message::CipherSuite;

const EXPLICIT_NONCE_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// AES-128-GCM record protection (RFC 5288).
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes128GcmProvider;

impl CipherProvider for Aes128GcmProvider {
    fn suite(&self) -> CipherSuite {
        CipherSuite::ECDHE_PSK_AES128_GCM_SHA256
    }

    fn key_lengths(&self) -> (usize, usize) {
        (16, 4)
    }

    fn expansion(&self) -> usize {
        EXPLICIT_NONCE_LEN + TAG_LEN
    }

    fn create_cipher(&self, key: &[u8], fixed_iv: &[u8]) -> Result<Box<dyn RecordCipher>, String> {
        let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| "Invalid AES-128 key".to_string())?;
        let fixed_iv: [u8; 4] = fixed_iv
            .try_into()
            .map_err(|_| "Invalid GCM fixed IV length".to_string())?;
        Ok(Box::new(AesGcmCipher { cipher, fixed_iv }))
    }
}

struct AesGcmCipher {
    cipher: Aes128Gcm,
    fixed_iv: [u8; 4],
}

impl AesGcmCipher {
    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed_iv);
        nonce[4..].copy_from_slice(explicit);
        nonce
    }
}

impl RecordCipher for AesGcmCipher {
    fn seal(&self, aad: &Aad, plaintext: &[u8]) -> Result<Vec<u8>, String> {
        let explicit = aad.explicit_nonce();
        let nonce = self.nonce(&explicit);
        let aad_bytes = aad.to_bytes(plaintext.len());

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad_bytes,
                },
            )
            .map_err(|_| "Encryption failed".to_string())?;

        let mut out = Vec::with_capacity(EXPLICIT_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&explicit);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, aad: &Aad, fragment: &[u8]) -> Result<Vec<u8>, String> {
        if fragment.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(format!("Fragment too short: {}", fragment.len()));
        }
        let (explicit, ciphertext) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let nonce = self.nonce(explicit);
        let aad_bytes = aad.to_bytes(ciphertext.len() - TAG_LEN);

        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad_bytes,
                },
            )
            .map_err(|_| "Bad record MAC".to_string())
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentType;

    fn aad(sequence_number: u64) -> Aad {
        Aad {
            content_type: ContentType::ApplicationData,
            epoch: 1,
            sequence_number,
        }
    }

    #[test]
    fn tampered_fragment_fails() {
        let cipher = Aes128GcmProvider.create_cipher(&[7; 16], &[1; 4]).unwrap();
        let mut sealed = cipher.seal(&aad(3), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(cipher.open(&aad(3), &sealed).is_err());
    }

    #[test]
    fn header_is_authenticated() {
        let cipher = Aes128GcmProvider.create_cipher(&[7; 16], &[1; 4]).unwrap();
        let sealed = cipher.seal(&aad(3), b"payload").unwrap();
        assert!(cipher.open(&aad(4), &sealed).is_err());
        assert_eq!(cipher.open(&aad(3), &sealed).unwrap(), b"payload");
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(Aes128GcmProvider.create_cipher(&[0; 15], &[0; 4]).is_err());
    }
}
