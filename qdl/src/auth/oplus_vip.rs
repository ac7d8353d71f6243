// SPDX-License-Identifier: BSD-3-Clause

//! OPLUS VIP authentication. Two pre-computed blobs (a chained
//! SHA-256 digest table, at most 4 KiB, and an externally-produced
//! signature over it, at most 512 B) are uploaded via a
//! `firmwarewrite`-style command right after `<configure>`, before any
//! `program`. The digest table itself comes from [`crate::vip`]; this
//! strategy only carries the two finished blobs across the wire.

use crate::auth::{AuthChannel, AuthStrategy};
use crate::errors::AuthError;

const MAX_DIGEST_LEN: usize = 4096;
const MAX_SIGNATURE_LEN: usize = 512;

pub struct OplusVipAuth {
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
}

impl OplusVipAuth {
    pub fn new(digest: Vec<u8>, signature: Vec<u8>) -> Self {
        OplusVipAuth { digest, signature }
    }
}

impl AuthStrategy for OplusVipAuth {
    /// `challenge` is unused: OPLUS VIP isn't a challenge/response scheme,
    /// the device simply accepts or rejects the pre-signed blob pair.
    fn authenticate(&mut self, channel: &mut dyn AuthChannel, _challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        if self.digest.len() > MAX_DIGEST_LEN {
            return Err(AuthError::Rejected(format!("digest table is {} bytes, exceeds the {MAX_DIGEST_LEN} byte limit", self.digest.len())));
        }
        if self.signature.len() > MAX_SIGNATURE_LEN {
            return Err(AuthError::Rejected(format!(
                "signature is {} bytes, exceeds the {MAX_SIGNATURE_LEN} byte limit",
                self.signature.len()
            )));
        }

        let digest_len = self.digest.len().to_string();
        let signature_len = self.signature.len().to_string();
        channel.send_xml("firmwarewrite", &[("digest_size", digest_len.as_str()), ("signature_size", signature_len.as_str())])?;
        channel.send_bytes(&self.digest)?;
        channel.send_bytes(&self.signature)?;

        let resp = channel.read_response()?;
        match resp.get("value").map(String::as_str) {
            Some("ACK") => Ok(Vec::new()),
            _ => Err(AuthError::Rejected("device rejected OPLUS VIP digest/signature pair".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    struct FakeChannel {
        ack: bool,
    }
    impl AuthChannel for FakeChannel {
        fn send_xml(&mut self, _tag: &str, _args: &[(&str, &str)]) -> Result<(), AuthError> {
            Ok(())
        }
        fn read_response(&mut self) -> Result<IndexMap<String, String>, AuthError> {
            let mut m = IndexMap::new();
            m.insert("value".to_string(), if self.ack { "ACK".to_string() } else { "NAK".to_string() });
            Ok(m)
        }
        fn send_bytes(&mut self, _bytes: &[u8]) -> Result<(), AuthError> {
            Ok(())
        }
        fn read_bytes(&mut self, _len: usize) -> Result<Vec<u8>, AuthError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn oversized_digest_is_rejected_before_any_write() {
        let mut auth = OplusVipAuth::new(vec![0u8; MAX_DIGEST_LEN + 1], vec![0u8; 16]);
        let mut channel = FakeChannel { ack: true };
        let result = auth.authenticate(&mut channel, &[]);
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }

    #[test]
    fn nak_surfaces_as_rejected() {
        let mut auth = OplusVipAuth::new(vec![1, 2, 3], vec![4, 5, 6]);
        let mut channel = FakeChannel { ack: false };
        let result = auth.authenticate(&mut channel, &[]);
        assert!(matches!(result, Err(AuthError::Rejected(_))));
    }
}
