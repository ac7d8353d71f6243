// SPDX-License-Identifier: BSD-3-Clause

//! OnePlus Demacia / SetProjModel authentication. Two-step XML over
//! Firehose builds an AES-256-CBC token from the device serial, a random
//! 16-char key, a SHA-256 of `prod_key || proj_id || postfix`, and a
//! timestamp. Three key recipes (`v1`, `v2`/`demacia`, `v3`/`setswprojmodel`)
//! are selected by `proj_id`.

use aes::Aes256;
use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::auth::{AuthChannel, AuthStrategy, KeyProvider};
use crate::errors::AuthError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Key-derivation recipe, selected by `proj_id` the same way the device
/// picks its own verification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnePlusRecipe {
    V1,
    V2Demacia,
    V3SetSwProjModel,
}

pub struct OnePlusAuth<'a> {
    pub recipe: OnePlusRecipe,
    pub proj_id: String,
    pub keys: &'a dyn KeyProvider,
}

fn random_key16() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::thread_rng().fill(&mut key);
    key
}

/// Decodes a device-supplied timestamp as either ASCII decimal or a raw
/// little-endian `u64`. Both are attempted, and a value that decodes to
/// neither is `AuthError::Rejected` carrying the raw bytes rather than a
/// panic.
fn decode_timestamp(raw: &[u8]) -> Result<u64, AuthError> {
    if let Ok(s) = std::str::from_utf8(raw) {
        if let Ok(v) = s.trim().parse::<u64>() {
            return Ok(v);
        }
    }
    if raw.len() == 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        return Ok(u64::from_le_bytes(buf));
    }
    Err(AuthError::Rejected(format!("unrecognised v3 timestamp: {raw:02x?}")))
}

impl<'a> OnePlusAuth<'a> {
    fn derive_aes_key(&self, serial: &[u8], postfix: &[u8], timestamp: Option<&[u8]>) -> Result<[u8; 32], AuthError> {
        let prod_key = self
            .keys
            .key_for(&self.proj_id)
            .ok_or_else(|| AuthError::KeyNotFound(self.proj_id.clone()))?;

        let mut hasher = Sha256::new();
        hasher.update(&prod_key);
        hasher.update(self.proj_id.as_bytes());
        hasher.update(postfix);
        if self.recipe == OnePlusRecipe::V3SetSwProjModel {
            let ts_raw = timestamp.ok_or_else(|| AuthError::Rejected("v3 requires a device timestamp".into()))?;
            let ts = decode_timestamp(ts_raw)?;
            hasher.update(ts.to_le_bytes());
        }
        hasher.update(serial);
        Ok(hasher.finalize().into())
    }
}

impl<'a> AuthStrategy for OnePlusAuth<'a> {
    /// `challenge` is the device serial (the "real" challenge material);
    /// the random key and any v3 timestamp are pulled from the channel via
    /// a `<getvar>`-style round trip before the token is built.
    fn authenticate(&mut self, channel: &mut dyn AuthChannel, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        channel.send_xml("getvar", &[("name", "postfix")])?;
        let postfix_resp = channel.read_response()?;
        let postfix = postfix_resp.get("value").cloned().unwrap_or_default();

        let timestamp_bytes = if self.recipe == OnePlusRecipe::V3SetSwProjModel {
            channel.send_xml("getvar", &[("name", "timestamp")])?;
            let resp = channel.read_response()?;
            Some(resp.get("value").cloned().unwrap_or_default().into_bytes())
        } else {
            None
        };

        let key = self.derive_aes_key(challenge, postfix.as_bytes(), timestamp_bytes.as_deref())?;
        let random_key = random_key16();

        let iv = [0u8; 16];
        let mut buffer = vec![0u8; challenge.len() + 16];
        buffer[..challenge.len()].copy_from_slice(challenge);
        let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
        let ciphertext = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, challenge.len())
            .map_err(|e| AuthError::Rejected(e.to_string()))?;

        let mut token = random_key.to_vec();
        token.extend_from_slice(ciphertext);
        Ok(token)
    }
}
