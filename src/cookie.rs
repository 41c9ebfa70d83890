//! Stateless HelloVerifyRequest cookies (RFC 6347, section 4.2.1).
//!
//! The cookie is an HMAC over the peer address and the ClientHello
//! parameters. Verifying it needs nothing but the secret, so a spoofed
//! ClientHello never causes the server to allocate state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::message::{ClientHello, Cookie};
use crate::rng::SeededRng;
use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of checking the cookie of a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieCheck {
    Valid,
    /// Missing or wrong, the peer must echo this one.
    Expected(Cookie),
}

/// Computes and verifies cookies, rotating the secret once per lifetime.
///
/// Cookies made with the previous secret are still accepted, so a client
/// that got its HelloVerifyRequest just before a rotation is not rejected.
pub struct CookieGenerator {
    lifetime: Duration,
    secrets: Mutex<Secrets>,
}

struct Secrets {
    current: Zeroizing<[u8; 32]>,
    previous: Option<Zeroizing<[u8; 32]>>,
    rotated_at: Instant,
    rng: SeededRng,
}

impl CookieGenerator {
    pub fn new(lifetime: Duration, seed: Option<u64>, now: Instant) -> Self {
        let mut rng = SeededRng::new(seed);
        let mut current = Zeroizing::new([0u8; 32]);
        rng.fill(&mut current[..]);
        CookieGenerator {
            lifetime,
            secrets: Mutex::new(Secrets {
                current,
                previous: None,
                rotated_at: now,
                rng,
            }),
        }
    }

    /// The cookie the peer is expected to echo.
    #[cfg(test)]
    pub fn generate(&self, peer: SocketAddr, hello: &ClientHello, now: Instant) -> Result<Cookie, Error> {
        let mut secrets = self.secrets.lock();
        self.rotate_if_due(&mut secrets, now);
        expected(&secrets.current[..], peer, hello)
    }

    /// Check the cookie carried by `hello`.
    ///
    /// On mismatch the expected cookie is returned for the HelloVerifyRequest.
    pub fn verify(&self, peer: SocketAddr, hello: &ClientHello, now: Instant) -> Result<CookieCheck, Error> {
        let mut secrets = self.secrets.lock();
        self.rotate_if_due(&mut secrets, now);

        if !hello.cookie.is_empty() {
            if mac(&secrets.current[..], peer, hello)?
                .verify_slice(&hello.cookie)
                .is_ok()
            {
                return Ok(CookieCheck::Valid);
            }
            if let Some(previous) = &secrets.previous {
                if mac(&previous[..], peer, hello)?
                    .verify_slice(&hello.cookie)
                    .is_ok()
                {
                    return Ok(CookieCheck::Valid);
                }
            }
        }

        expected(&secrets.current[..], peer, hello).map(CookieCheck::Expected)
    }

    fn rotate_if_due(&self, secrets: &mut Secrets, now: Instant) {
        if now.saturating_duration_since(secrets.rotated_at) < self.lifetime {
            return;
        }
        trace!("Rotating cookie secret");
        let mut next = Zeroizing::new([0u8; 32]);
        secrets.rng.fill(&mut next[..]);
        let previous = std::mem::replace(&mut secrets.current, next);
        secrets.previous = Some(previous);
        secrets.rotated_at = now;
    }
}

fn expected(secret: &[u8], peer: SocketAddr, hello: &ClientHello) -> Result<Cookie, Error> {
    let tag = mac(secret, peer, hello)?.finalize().into_bytes();
    Cookie::try_new(&tag).map_err(|e| Error::Crypto(e.to_string()))
}

fn mac(secret: &[u8], peer: SocketAddr, hello: &ClientHello) -> Result<HmacSha256, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| Error::Crypto("Invalid HMAC key length".into()))?;

    match peer {
        SocketAddr::V4(v4) => mac.update(&v4.ip().octets()),
        SocketAddr::V6(v6) => mac.update(&v6.ip().octets()),
    }
    mac.update(&peer.port().to_be_bytes());

    mac.update(&hello.client_version.as_u16().to_be_bytes());
    mac.update(&hello.random.0);
    mac.update(&[hello.session_id.len() as u8]);
    mac.update(&hello.session_id);
    for suite in &hello.cipher_suites {
        mac.update(&suite.as_u16().to_be_bytes());
    }
    mac.update(&hello.compression_methods);
    Ok(mac)
}

impl std::fmt::Debug for CookieGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieGenerator")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}
