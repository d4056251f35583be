//! XOR autokey codec for the legacy Smart Home protocol.
//!
//! Each output byte is the input byte XOR-ed with the previous ciphertext
//! byte, starting from key 171. The codec is obfuscation only, with no
//! authentication. TCP frames carry a 4-byte big-endian length prefix
//! ([`frame`]); UDP discovery probes are sent bare.

/// Initial key for the autokey stream.
const INITIAL_KEY: u8 = 171;

/// Size of the big-endian length prefix on TCP frames.
pub const LENGTH_PREFIX: usize = 4;

/// Encodes `plaintext` into the autokey stream.
///
/// ```
/// use kasa_bridge_core::crypto::xor::{decrypt, encrypt};
///
/// let msg = br#"{"system":{"get_sysinfo":{}}}"#;
/// assert_eq!(decrypt(&encrypt(msg)), msg);
/// ```
pub fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plaintext
        .iter()
        .map(|&byte| {
            key ^= byte;
            key
        })
        .collect()
}

/// Decodes an autokey stream produced by [`encrypt`].
pub fn decrypt(ciphertext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    ciphertext
        .iter()
        .map(|&byte| {
            let plain = key ^ byte;
            key = byte;
            plain
        })
        .collect()
}

/// Encodes `plaintext` and prepends the TCP length prefix.
pub fn frame(plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + plaintext.len());
    out.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    out.extend(encrypt(plaintext));
    out
}

/// Decodes a payload into a string, replacing invalid UTF-8.
pub fn decrypt_to_string(ciphertext: &[u8]) -> String {
    String::from_utf8_lossy(&decrypt(ciphertext)).into_owned()
}
