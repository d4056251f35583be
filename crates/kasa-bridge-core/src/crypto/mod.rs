//! Ciphers for the two local protocols.
//!
//! - [`xor`]: legacy autokey obfuscation (TCP 9999 and UDP discovery)
//! - [`klap`]: KLAP handshake hashes and the signed AES-128-CBC request cipher

pub mod klap;
pub mod xor;

pub use klap::{KlapCipherError, KlapEncryptionSession, generate_auth_hash, generate_auth_hash_v2};
