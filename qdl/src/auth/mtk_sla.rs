// SPDX-License-Identifier: BSD-3-Clause

//! MediaTek SLA authentication. The BROM hands a 16-byte challenge;
//! the response is an RSA-PSS-SHA-256 signature over it using a private
//! key keyed by `hw_code`. Unlike the other three strategies this one is
//! consumed by [`crate::mtk::bring_up`]'s raw `&mut dyn FnMut` callback
//! rather than an [`AuthChannel`] (the BROM/DA wire format predates the
//! XML-framed strategies entirely), so [`MtkSlaAuth::sign`] is exposed
//! directly alongside the [`AuthStrategy`] impl used for trait-object
//! uniformity.

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use sha2::Sha256;

use crate::auth::{AuthChannel, AuthStrategy, KeyProvider};
use crate::errors::AuthError;

pub struct MtkSlaAuth<'a> {
    pub hw_code: u16,
    pub keys: &'a dyn KeyProvider,
}

impl<'a> MtkSlaAuth<'a> {
    pub fn new(hw_code: u16, keys: &'a dyn KeyProvider) -> Self {
        MtkSlaAuth { hw_code, keys }
    }

    fn key_id(&self) -> String {
        format!("{:#06x}", self.hw_code)
    }

    /// Signs `challenge` (the BROM's 16-byte SLA nonce) and returns the
    /// raw signature bytes, ready to upload as-is (length-prefixed bytes,
    /// no XML framing).
    pub fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        let key_id = self.key_id();
        let der = self.keys.key_for(&key_id).ok_or_else(|| AuthError::KeyNotFound(key_id))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| AuthError::Rejected(e.to_string()))?;
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let signature = signing_key.sign_with_rng(&mut OsRng, challenge);
        Ok(signature.to_bytes().to_vec())
    }
}

impl<'a> AuthStrategy for MtkSlaAuth<'a> {
    fn authenticate(&mut self, _channel: &mut dyn AuthChannel, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.sign(challenge)
    }
}
