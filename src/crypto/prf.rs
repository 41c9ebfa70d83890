use hmac::{Hmac, Mac};
use sha2::Sha256;
use tinyvec::ArrayVec;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// PRF for TLS 1.2 with SHA-256, as specified in RFC 5246 Section 5.
///
/// PRF(secret, label, seed) = P_SHA256(secret, label + seed)
///
/// The seed parameter is the seed data WITHOUT the label.
pub fn prf_tls12(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
) -> Result<ArrayVec<[u8; 128]>, String> {
    if output_len > 128 {
        return Err(format!("PRF output too long: {}", output_len));
    }

    let mut full_seed: ArrayVec<[u8; 128]> = ArrayVec::default();
    if label.len() + seed.len() > full_seed.capacity() {
        return Err("PRF seed too long".to_string());
    }
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    p_hash(secret, &full_seed, output_len)
}

fn p_hash(secret: &[u8], full_seed: &[u8], output_len: usize) -> Result<ArrayVec<[u8; 128]>, String> {
    let mut result = ArrayVec::default();

    let new_mac = || HmacSha256::new_from_slice(secret).map_err(|_| "Invalid HMAC key".to_string());

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut mac = new_mac()?;
    mac.update(full_seed);
    let mut a = mac.finalize().into_bytes();

    while result.len() < output_len {
        // HMAC_hash(secret, A(i) + seed)
        let mut mac = new_mac()?;
        mac.update(&a);
        mac.update(full_seed);
        let output = mac.finalize().into_bytes();

        let remaining = output_len - result.len();
        let to_copy = remaining.min(output.len());
        result.extend_from_slice(&output[..to_copy]);

        if result.len() < output_len {
            // A(i+1) = HMAC_hash(secret, A(i))
            let mut mac = new_mac()?;
            mac.update(&a);
            a = mac.finalize().into_bytes();
        }
    }

    Ok(result)
}

/// master_secret = PRF(pre_master_secret, "master secret", client_random + server_random)[0..47]
pub fn master_secret(
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Zeroizing<[u8; 48]>, String> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);

    let out = prf_tls12(pre_master_secret, "master secret", &seed, 48)?;
    let mut master = Zeroizing::new([0u8; 48]);
    master.copy_from_slice(&out);
    Ok(master)
}

/// key_block = PRF(master_secret, "key expansion", server_random + client_random)
pub fn key_expansion(
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    key_material_length: usize,
) -> Result<Zeroizing<Vec<u8>>, String> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);

    let out = prf_tls12(master_secret, "key expansion", &seed, key_material_length)?;
    Ok(Zeroizing::new(out.to_vec()))
}

/// verify_data = PRF(master_secret, finished_label, Hash(handshake_messages))[0..11]
pub fn verify_data(
    master_secret: &[u8],
    label: &str,
    handshake_hash: &[u8],
) -> Result<[u8; 12], String> {
    let out = prf_tls12(master_secret, label, handshake_hash, 12)?;
    let mut data = [0u8; 12];
    data.copy_from_slice(&out);
    Ok(data)
}

/// Premaster secret for ECDHE_PSK (RFC 5489, section 2).
///
/// other_secret is the ECDH shared secret.
pub fn psk_premaster_secret(other_secret: &[u8], psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(4 + other_secret.len() + psk.len()));
    out.extend_from_slice(&(other_secret.len() as u16).to_be_bytes());
    out.extend_from_slice(other_secret);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}
