// SPDX-License-Identifier: BSD-3-Clause

//! Xiaomi EDL authentication. The device hands back a base64 token
//! prefixed `VQ`; signing it requires an external credential this crate
//! has no business holding, so a missing [`KeyProvider`] surfaces
//! `AuthError::TokenNeeded` instead of failing outright, letting a caller
//! hand the token to whatever out-of-band signer it has.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::auth::{AuthChannel, AuthStrategy, KeyProvider};
use crate::errors::AuthError;

pub struct XiaomiAuth<'a> {
    pub keys: Option<&'a dyn KeyProvider>,
}

impl<'a> XiaomiAuth<'a> {
    pub fn new(keys: Option<&'a dyn KeyProvider>) -> Self {
        XiaomiAuth { keys }
    }
}

impl<'a> AuthStrategy for XiaomiAuth<'a> {
    /// `challenge` is the raw token bytes as they came off the wire
    /// (already base64-text, not yet decoded).
    fn authenticate(&mut self, channel: &mut dyn AuthChannel, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        let token = std::str::from_utf8(challenge).map_err(|e| AuthError::Rejected(e.to_string()))?.trim().to_string();
        if !token.starts_with("VQ") {
            return Err(AuthError::Rejected(format!("unexpected xiaomi token prefix: {token:?}")));
        }

        let Some(keys) = self.keys else {
            return Err(AuthError::TokenNeeded(token));
        };

        let decoded = STANDARD.decode(&token).map_err(|e| AuthError::Rejected(e.to_string()))?;
        let signature = keys.key_for(&token).ok_or_else(|| AuthError::KeyNotFound(token.clone()))?;

        channel.send_xml("auth_data", &[("len", signature.len().to_string().as_str())])?;
        channel.send_bytes(&signature)?;
        let resp = channel.read_response()?;
        match resp.get("value").map(String::as_str) {
            Some("ACK") => Ok(decoded),
            _ => Err(AuthError::Rejected("device rejected xiaomi auth_data".into())),
        }
    }
}
