//! KLAP authentication hashes and request cipher.
//!
//! The handshake helpers compute the hashes exchanged in `/app/handshake1`
//! and `/app/handshake2`. [`KlapEncryptionSession`] holds the key schedule
//! derived once both seeds and the auth hash are known, and frames every
//! request as `sha256(sig ‖ seq ‖ ct) ‖ ct` with AES-128-CBC.
//!
//! The same session type is used by both ends of the exchange, which is how
//! the test simulator speaks KLAP.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

use crate::Credentials;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length of the local and remote handshake seeds.
pub const SEED_LEN: usize = 16;

/// Length of the SHA-256 signature prepended to each payload.
const SIGNATURE_LEN: usize = 32;

/// Errors from the KLAP request cipher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KlapCipherError {
    #[error("payload too short: {0} bytes")]
    TooShort(usize),

    #[error("signature mismatch for seq {0}")]
    SignatureMismatch(i32),

    #[error("seq {seq} not above last accepted {last}")]
    Replayed { seq: i32, last: i32 },

    #[error("bad padding")]
    Padding,
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// KLAP v1 auth hash: `md5(md5(username) ‖ md5(password))`.
pub fn generate_auth_hash(credentials: &Credentials) -> [u8; 16] {
    let user = Md5::digest(credentials.username.as_bytes());
    let pass = Md5::digest(credentials.expose_password().as_bytes());
    let mut hasher = Md5::new();
    hasher.update(user);
    hasher.update(pass);
    hasher.finalize().into()
}

/// KLAP v2 auth hash: `sha256(sha1(username) ‖ sha1(password))`.
pub fn generate_auth_hash_v2(credentials: &Credentials) -> [u8; 32] {
    let user = Sha1::digest(credentials.username.as_bytes());
    let pass = Sha1::digest(credentials.expose_password().as_bytes());
    sha256(&[&user[..], &pass[..]])
}

/// Expected handshake1 server hash, v1: `sha256(local ‖ auth)`.
pub fn handshake1_seed_auth_hash(local_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[local_seed, auth_hash])
}

/// Expected handshake1 server hash, v2: `sha256(local ‖ remote ‖ auth)`.
pub fn handshake1_seed_auth_hash_v2(
    local_seed: &[u8],
    remote_seed: &[u8],
    auth_hash: &[u8],
) -> [u8; 32] {
    sha256(&[local_seed, remote_seed, auth_hash])
}

/// Handshake2 payload, v1: `sha256(remote ‖ auth)`.
pub fn handshake2_seed_auth_hash(remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256(&[remote_seed, auth_hash])
}

/// Handshake2 payload, v2: `sha256(remote ‖ local ‖ auth)`.
pub fn handshake2_seed_auth_hash_v2(
    local_seed: &[u8],
    remote_seed: &[u8],
    auth_hash: &[u8],
) -> [u8; 32] {
    sha256(&[remote_seed, local_seed, auth_hash])
}

/// Symmetric state of an established KLAP session.
///
/// `seq` is the last sequence number this side sent; `last_accepted` the
/// highest one it has verified from the peer. Both start at the seed
/// derived from the handshake.
#[derive(Clone)]
pub struct KlapEncryptionSession {
    key: [u8; 16],
    iv_base: [u8; 12],
    sig: [u8; 28],
    seq: i32,
    last_accepted: i32,
}

impl KlapEncryptionSession {
    /// Derives the key schedule from both seeds and the matched auth hash.
    pub fn new(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let key_full = sha256(&[b"lsk".as_slice(), local_seed, remote_seed, auth_hash]);
        let iv_full = sha256(&[b"iv".as_slice(), local_seed, remote_seed, auth_hash]);
        let sig_full = sha256(&[b"ldk".as_slice(), local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_full[..16]);
        let mut iv_base = [0u8; 12];
        iv_base.copy_from_slice(&iv_full[..12]);
        let mut sig = [0u8; 28];
        sig.copy_from_slice(&sig_full[..28]);
        let seq = i32::from_be_bytes([iv_full[28], iv_full[29], iv_full[30], iv_full[31]]);

        Self {
            key,
            iv_base,
            sig,
            seq,
            last_accepted: seq,
        }
    }

    /// Last sequence number used for an outgoing payload.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Advances the sequence number and encrypts `msg` under it.
    pub fn encrypt(&mut self, msg: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        (self.encrypt_with_seq(msg, self.seq), self.seq)
    }

    /// Encrypts `msg` under an explicit sequence number.
    ///
    /// Replies are framed with the sequence number of the request they
    /// answer, so the responding side uses this instead of [`encrypt`](Self::encrypt).
    pub fn encrypt_with_seq(&self, msg: &[u8], seq: i32) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv_for(seq).into())
            .encrypt_padded_vec_mut::<Pkcs7>(msg);
        let signature = sha256(&[self.sig.as_slice(), &seq.to_be_bytes()[..], &ciphertext]);

        let mut out = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        out.extend_from_slice(&signature);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Verifies and decrypts a payload framed under `seq`.
    ///
    /// Rejects any sequence number not strictly above the last accepted one,
    /// and any payload whose signature does not cover `seq`.
    pub fn decrypt(&mut self, payload: &[u8], seq: i32) -> Result<Vec<u8>, KlapCipherError> {
        if seq.wrapping_sub(self.last_accepted) <= 0 {
            return Err(KlapCipherError::Replayed {
                seq,
                last: self.last_accepted,
            });
        }
        if payload.len() < SIGNATURE_LEN {
            return Err(KlapCipherError::TooShort(payload.len()));
        }

        let (signature, ciphertext) = payload.split_at(SIGNATURE_LEN);
        let expected = sha256(&[self.sig.as_slice(), &seq.to_be_bytes()[..], ciphertext]);
        if signature != expected {
            return Err(KlapCipherError::SignatureMismatch(seq));
        }

        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv_for(seq).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| KlapCipherError::Padding)?;
        self.last_accepted = seq;
        Ok(plain)
    }

    fn iv_for(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_base);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }
}

impl std::fmt::Debug for KlapEncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapEncryptionSession")
            .field("seq", &self.seq)
            .field("last_accepted", &self.last_accepted)
            .finish_non_exhaustive()
    }
}
