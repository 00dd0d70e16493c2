//! Key block: outer block 0 of a `CryptStore`.
//!
//! Layout, grounded directly on `AtAfsCryptStorage.cpp`'s `Init`:
//!
//! ```text
//! offset  0  sig1            4 bytes  "AfsC"
//! offset  4  sig2            4 bytes  "rypt"
//! offset  8  prefix_version   4 bytes
//! offset 12  ciphertext_len   4 bytes
//! offset 16  iv              16 bytes
//! offset 32  ciphertext       N bytes  (CBC, access-encryption key)
//! offset 32+N mac            64 bytes  (HMAC-SHA512, access-MAC key, over
//!                                       everything preceding it)
//! ```
//!
//! The encrypted payload is `payload_version(4) ∥ inner_block_size(4) ∥
//! master_secret(32) ∥ random padding` out to `ciphertext_len` bytes.
use std::convert::TryInto;

use failure::{format_err, Error};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;

use super::{cbc_decrypt, cbc_encrypt, ct_eq};

const SIG1: &[u8; 4] = b"AfsC";
const SIG2: &[u8; 4] = b"rypt";
const PREFIX_VERSION: u32 = 1;
const PAYLOAD_VERSION: u32 = 1;
const PREFIX_LEN: usize = 16; // sig1 + sig2 + prefix_version + ciphertext_len
const IV_LEN: usize = 16;
const KEYBLOCK_MAC_LEN: usize = 64;
const PAYLOAD_HEADER_LEN: usize = 4 + 4; // payload_version + inner_block_size
const MASTER_SECRET_LEN: usize = 32;

type HmacSha512 = Hmac<Sha512>;

pub(super) struct KeyBlock;

impl KeyBlock {
    /// Build a fresh, sealed key block.
    pub(super) fn seal(
        master_secret: &[u8; 32],
        inner_block_size: u32,
        outer_block_size: usize,
        access_encr_key: &[u8; 32],
        access_mac_key: &[u8; 64],
    ) -> Result<Vec<u8>, Error> {
        let ciphertext_len = outer_block_size - PREFIX_LEN - IV_LEN - KEYBLOCK_MAC_LEN;
        if ciphertext_len % 16 != 0 || ciphertext_len < PAYLOAD_HEADER_LEN + MASTER_SECRET_LEN {
            return Err(format_err!(
                "outer block size {} too small for a key block",
                outer_block_size
            ));
        }

        let mut payload = vec![0u8; ciphertext_len];
        payload[0..4].copy_from_slice(&PAYLOAD_VERSION.to_le_bytes());
        payload[4..8].copy_from_slice(&inner_block_size.to_le_bytes());
        payload[8..8 + MASTER_SECRET_LEN].copy_from_slice(master_secret);
        rand::thread_rng().fill_bytes(&mut payload[8 + MASTER_SECRET_LEN..]);

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = cbc_encrypt(access_encr_key, &iv, &payload);

        let mut block = Vec::with_capacity(outer_block_size);
        block.extend_from_slice(SIG1);
        block.extend_from_slice(SIG2);
        block.extend_from_slice(&PREFIX_VERSION.to_le_bytes());
        block.extend_from_slice(&(ciphertext_len as u32).to_le_bytes());
        block.extend_from_slice(&iv);
        block.extend_from_slice(&ciphertext);

        let mut hmac = HmacSha512::new_varkey(access_mac_key).expect("HMAC accepts any key length");
        hmac.input(&block);
        let mac = hmac.result().code();
        block.extend_from_slice(&mac);

        Ok(block)
    }

    /// Authenticate and open an existing key block.
    ///
    /// Returns `Ok(None)` on a MAC mismatch (unauthenticated, not fatal).
    /// Returns `Err` for a signature, version, or length mismatch, or if
    /// the decrypted payload doesn't parse (which is what a wrong
    /// encryption key looks like, since the payload version is recoverable
    /// only by decrypting with the right key).
    pub(super) fn open(
        raw: &[u8],
        access_encr_key: &[u8; 32],
        access_mac_key: &[u8; 64],
    ) -> Result<Option<[u8; 32]>, Error> {
        if raw.len() < PREFIX_LEN + IV_LEN + KEYBLOCK_MAC_LEN {
            return Err(format_err!("key block too short"));
        }
        if &raw[0..4] != SIG1 || &raw[4..8] != SIG2 {
            return Err(format_err!("SignatureMismatch"));
        }
        let prefix_version = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        if prefix_version != PREFIX_VERSION {
            return Err(format_err!("VersionMismatch"));
        }
        let ciphertext_len = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as usize;
        let expected_len = PREFIX_LEN + IV_LEN + ciphertext_len + KEYBLOCK_MAC_LEN;
        if expected_len != raw.len() {
            return Err(format_err!("key block length mismatch"));
        }

        let body = &raw[..PREFIX_LEN + IV_LEN + ciphertext_len];
        let stored_mac = &raw[PREFIX_LEN + IV_LEN + ciphertext_len..];

        let mut hmac = HmacSha512::new_varkey(access_mac_key).expect("HMAC accepts any key length");
        hmac.input(body);
        let expected_mac = hmac.result().code();
        if !ct_eq(&expected_mac, stored_mac) {
            return Ok(None);
        }

        let iv: [u8; IV_LEN] = raw[PREFIX_LEN..PREFIX_LEN + IV_LEN].try_into().unwrap();
        let ciphertext = &raw[PREFIX_LEN + IV_LEN..PREFIX_LEN + IV_LEN + ciphertext_len];
        let payload = cbc_decrypt(access_encr_key, &iv, ciphertext);

        let payload_version = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if payload_version != PAYLOAD_VERSION {
            return Err(format_err!("VersionMismatch"));
        }

        let mut master_secret = [0u8; MASTER_SECRET_LEN];
        master_secret.copy_from_slice(&payload[8..8 + MASTER_SECRET_LEN]);
        Ok(Some(master_secret))
    }
}
