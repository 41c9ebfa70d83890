use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Ephemeral x25519 key exchange.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyExchange { secret, public }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        self.public.as_bytes()
    }

    /// Compute the shared secret with the peer's public key.
    pub fn complete(self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, String> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| format!("Invalid x25519 public key length: {}", peer_public.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err("Non-contributory x25519 key exchange".to_string());
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let a = KeyExchange::new();
        let b = KeyExchange::new();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();
        assert_eq!(*a.complete(&b_pub).unwrap(), *b.complete(&a_pub).unwrap());
    }

    #[test]
    fn rejects_low_order_point() {
        let a = KeyExchange::new();
        assert!(a.complete(&[0; 32]).is_err());
    }
}
