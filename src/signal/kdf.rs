use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// HMAC-SHA256 producing the fixed 32-byte output.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HKDF-SHA256 expansion into a caller-sized buffer.
pub fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, out)
        .expect("hkdf output length is always within bounds");
}

/// Derives `(root_key, chain_key)` from DH output under the given label.
pub fn derive_ratchet_keys(salt: &[u8; 32], ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut output = [0_u8; 64];
    hkdf_expand(ikm, salt, info, &mut output);

    let mut root = [0_u8; 32];
    root.copy_from_slice(&output[..32]);
    let mut chain = [0_u8; 32];
    chain.copy_from_slice(&output[32..]);
    (root, chain)
}

/// Message-key material: cipher key, mac key and iv.
pub struct MessageKeyMaterial {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
}

/// Expands one ratchet message key into its cipher/mac/iv parts.
pub fn derive_message_material(message_key: &[u8; 32]) -> MessageKeyMaterial {
    let mut output = [0_u8; 80];
    hkdf_expand(message_key, &[0_u8; 32], b"WhisperMessageKeys", &mut output);

    let mut cipher_key = [0_u8; 32];
    cipher_key.copy_from_slice(&output[..32]);
    let mut mac_key = [0_u8; 32];
    mac_key.copy_from_slice(&output[32..64]);
    let mut iv = [0_u8; 16];
    iv.copy_from_slice(&output[64..]);

    MessageKeyMaterial {
        cipher_key,
        mac_key,
        iv,
    }
}
