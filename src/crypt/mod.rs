//! Transparent encrypting `BlockStore`
//!
//! `CryptStore` wraps another ("outer") `BlockStore` and exposes a smaller
//! ("inner") block size to its caller. Block 0 of the outer store is a key
//! block, not exposed as an inner block; every other outer block holds
//! `salt ∥ ciphertext ∥ MAC` for one inner block.
//!
//! The per-block key/IV/MAC derivation and the manual CBC chaining below
//! follow `AtAfsCryptStorage.cpp`'s `ProcessBlock`/`CalcBlockMac` directly:
//! AES is used as an injected block primitive (`aes::Aes256`) and the CBC
//! chaining/MAC-prefix construction is glue code around it, exactly as the
//! original does around its own `ACS_*` cipher hooks.
mod keyblock;

use std::convert::TryInto;

use aes::block_cipher_trait::BlockCipher;
use aes::Aes256;
use failure::{format_err, Error};
use generic_array::GenericArray;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::store::{check_block_size, BlockAllocator, BlockIndex, BlockStore, WriteBatch};
use keyblock::KeyBlock;

const SALT_LEN: usize = 16;
const MAC_LEN: usize = 32;
const OVERHEAD: usize = SALT_LEN + MAC_LEN;
const AES_BLOCK_LEN: usize = 16;

type HmacSha512 = Hmac<Sha512>;

/// A `BlockStore` that transparently encrypts and authenticates each block
/// of another ("outer") `BlockStore`.
pub struct CryptStore<S: BlockStore> {
    outer: S,
    inner_block_size: u32,
    master_secret: [u8; 32],
    allocator: BlockAllocator,
}

impl<S: BlockStore> Drop for CryptStore<S> {
    fn drop(&mut self) {
        // Key material lives for the lifetime of the CryptStore; zero it on
        // drop rather than leaving it in freed memory.
        for b in self.master_secret.iter_mut() {
            *b = 0;
        }
    }
}

impl<S: BlockStore> CryptStore<S> {
    /// Initialize or open a `CryptStore` over `outer`.
    ///
    /// - If `outer` is empty, a fresh master secret is generated and the
    ///   key block is written inside a single journaled write; returns
    ///   `Ok(Some(_))`.
    /// - Otherwise the existing key block is read and authenticated with
    ///   `access_mac_key`. A MAC mismatch returns `Ok(None)` (unauthenticated,
    ///   not an error). A signature, version, or length mismatch is a fatal
    ///   error.
    pub fn init(
        mut outer: S,
        access_encr_key: &[u8; 32],
        access_mac_key: &[u8; 64],
    ) -> Result<Option<Self>, Error> {
        let outer_block_size = outer.block_size();
        if outer_block_size < 512 || outer_block_size % AES_BLOCK_LEN as u32 != 0 {
            return Err(format_err!(
                "outer block size must be >= 512 and a multiple of 16, got {}",
                outer_block_size
            ));
        }
        let inner_block_size = outer_block_size - OVERHEAD as u32;

        if outer.nr_blocks() == 0 {
            debug!("initializing a fresh CryptStore key block");
            let mut master_secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut master_secret);

            let key_block = KeyBlock::seal(
                &master_secret,
                inner_block_size,
                outer_block_size as usize,
                access_encr_key,
                access_mac_key,
            )?;

            let mut batch = outer.begin_journaled_write()?;
            batch.add_new_block(key_block);
            outer.complete_journaled_write(batch)?;

            let allocator = BlockAllocator::new();
            allocator.set_bytes_per_block(inner_block_size);

            Ok(Some(CryptStore {
                outer,
                inner_block_size,
                master_secret,
                allocator,
            }))
        } else {
            let raw = outer.obtain_block(0)?;
            match KeyBlock::open(&raw, access_encr_key, access_mac_key)? {
                None => {
                    warn!("CryptStore key block MAC mismatch");
                    Ok(None)
                }
                Some(master_secret) => {
                    let allocator = BlockAllocator::new();
                    allocator.set_bytes_per_block(inner_block_size);
                    Ok(Some(CryptStore {
                        outer,
                        inner_block_size,
                        master_secret,
                        allocator,
                    }))
                }
            }
        }
    }

    fn derive_enc_key_iv(&self, block_index: BlockIndex, salt: &[u8; SALT_LEN]) -> ([u8; 32], [u8; 16]) {
        let mut hasher = Sha512::new();
        hasher.update(&self.master_secret);
        hasher.update(&block_index.to_le_bytes());
        hasher.update(salt);
        hasher.update(b"ENC");
        let digest = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[32..48]);
        (key, iv)
    }

    fn block_mac(&self, block_index: BlockIndex, salt: &[u8; SALT_LEN], ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut hasher = Sha512::new();
        hasher.update(&self.master_secret);
        hasher.update(&block_index.to_le_bytes());
        hasher.update(salt);
        hasher.update(b"MAC");
        hasher.update(ciphertext);
        let digest = hasher.finalize();

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&digest[..MAC_LEN]);
        mac
    }

    fn encrypt_inner_block(&self, inner_index: BlockIndex, plaintext: &[u8]) -> Vec<u8> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let (key, iv) = self.derive_enc_key_iv(inner_index, &salt);
        let ciphertext = cbc_encrypt(&key, &iv, plaintext);
        let mac = self.block_mac(inner_index, &salt, &ciphertext);

        let mut outer = Vec::with_capacity(SALT_LEN + ciphertext.len() + MAC_LEN);
        outer.extend_from_slice(&salt);
        outer.extend_from_slice(&ciphertext);
        outer.extend_from_slice(&mac);
        outer
    }

    fn decrypt_outer_block(&self, inner_index: BlockIndex, outer_block: &[u8]) -> Result<Vec<u8>, Error> {
        let salt: [u8; SALT_LEN] = outer_block[..SALT_LEN].try_into().unwrap();
        let ciphertext = &outer_block[SALT_LEN..outer_block.len() - MAC_LEN];
        let stored_mac = &outer_block[outer_block.len() - MAC_LEN..];

        let expected_mac = self.block_mac(inner_index, &salt, ciphertext);
        if !ct_eq(&expected_mac, stored_mac) {
            return Err(format_err!("MacMismatch"));
        }

        let (key, iv) = self.derive_enc_key_iv(inner_index, &salt);
        Ok(cbc_decrypt(&key, &iv, ciphertext))
    }
}

/// Derive the `(access_encr_key, access_mac_key)` pair `CryptStore::init`
/// needs from a user-supplied password, salted with a caller-chosen value
/// (normally something identifying the store, e.g. its bundle path).
pub fn derive_access_keys(password: &str, salt: &[u8]) -> ([u8; 32], [u8; 64]) {
    let mut derived = [0u8; 96];
    pbkdf2::pbkdf2::<Hmac<sha2::Sha256>>(password.as_bytes(), salt, 271_828, &mut derived);
    let mut encr_key = [0u8; 32];
    let mut mac_key = [0u8; 64];
    encr_key.copy_from_slice(&derived[..32]);
    mac_key.copy_from_slice(&derived[32..]);
    (encr_key, mac_key)
}

/// Constant-time byte comparison, to avoid leaking MAC-match information
/// through early-exit timing.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn xor_in_place(block: &mut [u8; AES_BLOCK_LEN], other: &[u8]) {
    for i in 0..AES_BLOCK_LEN {
        block[i] ^= other[i];
    }
}

/// CBC-no-padding encryption. `plaintext.len()` must be a multiple of 16.
fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    debug_assert_eq!(plaintext.len() % AES_BLOCK_LEN, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    let mut out = Vec::with_capacity(plaintext.len());

    for chunk in plaintext.chunks(AES_BLOCK_LEN) {
        let mut block = [0u8; AES_BLOCK_LEN];
        block.copy_from_slice(chunk);
        xor_in_place(&mut block, &prev);
        let mut ga = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut ga);
        out.extend_from_slice(&ga);
        prev.copy_from_slice(&ga);
    }

    out
}

/// CBC-no-padding decryption, the inverse of `cbc_encrypt`.
fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Vec<u8> {
    debug_assert_eq!(ciphertext.len() % AES_BLOCK_LEN, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev = *iv;
    let mut out = Vec::with_capacity(ciphertext.len());

    for chunk in ciphertext.chunks(AES_BLOCK_LEN) {
        let mut ciphertext_block = [0u8; AES_BLOCK_LEN];
        ciphertext_block.copy_from_slice(chunk);

        let mut ga = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut ga);
        let mut plain = [0u8; AES_BLOCK_LEN];
        plain.copy_from_slice(&ga);
        xor_in_place(&mut plain, &prev);

        out.extend_from_slice(&plain);
        prev = ciphertext_block;
    }

    out
}

impl<S: BlockStore> BlockStore for CryptStore<S> {
    fn block_size(&self) -> u32 {
        self.inner_block_size
    }

    fn max_nr_blocks(&self) -> u64 {
        self.outer.max_nr_blocks().saturating_sub(1)
    }

    fn nr_blocks(&self) -> u64 {
        self.outer.nr_blocks().saturating_sub(1)
    }

    fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    fn obtain_block(&self, idx: BlockIndex) -> Result<Vec<u8>, Error> {
        let outer_idx = idx + 1;
        let outer_block = self.outer.obtain_block(outer_idx)?;
        self.decrypt_outer_block(idx, &outer_block)
    }

    fn begin_journaled_write(&mut self) -> Result<WriteBatch, Error> {
        self.outer.begin_journaled_write()
    }

    fn abort_journaled_write(&mut self, batch: WriteBatch) {
        self.outer.abort_journaled_write(batch);
    }

    fn complete_journaled_write(&mut self, batch: WriteBatch) -> Result<Vec<BlockIndex>, Error> {
        // The passed-in batch is expressed in *inner* indices/new-block
        // order (built by the caller via this trait's own `WriteBatch`, so
        // its `add_new_block` return values were inner indices). Translate
        // every entry to an outer batch: inner index i <-> outer index i+1.
        for data in &batch.new_blocks {
            check_block_size(data, self.inner_block_size)?;
        }
        for (_, data) in &batch.overwrites {
            check_block_size(data, self.inner_block_size)?;
        }

        let inner_base = self.nr_blocks();
        let mut outer_batch = self.outer.begin_journaled_write()?;

        for (i, plaintext) in batch.new_blocks.iter().enumerate() {
            let inner_idx = inner_base + i as BlockIndex;
            let outer_block = self.encrypt_inner_block(inner_idx, plaintext);
            outer_batch.add_new_block(outer_block);
        }
        for (inner_idx, plaintext) in &batch.overwrites {
            let outer_block = self.encrypt_inner_block(*inner_idx, plaintext);
            outer_batch.overwrite(inner_idx + 1, outer_block);
        }

        self.outer.complete_journaled_write(outer_batch)?;
        let assigned = (0..batch.new_blocks.len() as BlockIndex)
            .map(|i| inner_base + i)
            .collect();
        Ok(assigned)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn keys() -> ([u8; 32], [u8; 64]) {
        ([0x11; 32], [0x22; 64])
    }

    #[test]
    fn init_on_empty_store_creates_key_block() {
        init_logger();
        let (encr, mac) = keys();
        let outer = MemStore::new(512, 16);
        let store = CryptStore::init(outer, &encr, &mac).unwrap();
        assert!(store.is_some());
        let store = store.unwrap();
        assert_eq!(store.nr_blocks(), 0);
        assert_eq!(store.block_size(), 512 - OVERHEAD as u32);
    }

    #[test]
    fn round_trips_a_block() {
        init_logger();
        let (encr, mac) = keys();
        let outer = MemStore::new(512, 16);
        let mut store = CryptStore::init(outer, &encr, &mac).unwrap().unwrap();

        let plaintext = vec![0xab; store.block_size() as usize];
        let mut batch = store.begin_journaled_write().unwrap();
        batch.add_new_block(plaintext.clone());
        store.complete_journaled_write(batch).unwrap();

        assert_eq!(store.obtain_block(0).unwrap(), plaintext);
    }

    #[test]
    fn reopen_with_correct_keys_succeeds() {
        init_logger();
        let (encr, mac) = keys();
        let outer = MemStore::new(512, 16);
        let mut store = CryptStore::init(outer, &encr, &mac).unwrap().unwrap();
        let plaintext = vec![0x5c; store.block_size() as usize];
        let mut batch = store.begin_journaled_write().unwrap();
        batch.add_new_block(plaintext.clone());
        store.complete_journaled_write(batch).unwrap();

        // Simulate reopening by cracking the CryptStore apart and rebuilding
        // over the same outer store.
        let outer = store.outer;
        let reopened = CryptStore::init(outer, &encr, &mac).unwrap().unwrap();
        assert_eq!(reopened.obtain_block(0).unwrap(), plaintext);
    }

    #[test]
    fn reopen_with_wrong_mac_key_returns_none() {
        init_logger();
        let (encr, mac) = keys();
        let outer = MemStore::new(512, 16);
        let store = CryptStore::init(outer, &encr, &mac).unwrap().unwrap();
        let outer = store.outer;

        let wrong_mac = [0x33; 64];
        let result = CryptStore::init(outer, &encr, &wrong_mac).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn reopen_with_wrong_encr_key_fails_signature_check() {
        init_logger();
        let (encr, mac) = keys();
        let outer = MemStore::new(512, 16);
        let store = CryptStore::init(outer, &encr, &mac).unwrap().unwrap();
        let outer = store.outer;

        let wrong_encr = [0x44; 32];
        let result = CryptStore::init(outer, &wrong_encr, &mac);
        assert!(result.is_err());
    }
}
