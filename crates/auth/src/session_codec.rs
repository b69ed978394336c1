use hmac_sha256::HMAC;
use std::{fmt, sync::Arc};
use subtle::ConstantTimeEq;

use super::data_model::{EncodingError, Session};

/// Turns a [`Session`] into a signed, cookie-safe string and back.
/// Format is `hex(bincode(session)) "." hex(hmac_sha256(payload))`.
#[derive(Clone)]
pub struct SessionCodec {
    key: Arc<[u8]>,
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec").finish_non_exhaustive()
    }
}

impl SessionCodec {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Arc::from(key.into()),
        }
    }

    pub fn encode(&self, session: &Session) -> Result<String, EncodingError> {
        if session.credential.is_empty() {
            return Err(EncodingError::EmptyCredential);
        }
        let payload = bincode::serialize(session)?;
        let tag = HMAC::mac(&payload, &self.key);
        Ok(format!("{}.{}", hex::encode(payload), hex::encode(tag)))
    }

    /// Never fails loudly: anything malformed, tampered or signed with another key is `None`,
    /// which callers treat exactly like "no session".
    pub fn decode(&self, value: &str) -> Option<Session> {
        let (payload, tag) = value.split_once('.')?;
        let payload = hex::decode(payload).ok()?;
        let tag = hex::decode(tag).ok()?;
        let expected = HMAC::mac(&payload, &self.key);
        if expected.as_slice().ct_ne(tag.as_slice()).into() {
            return None;
        }
        bincode::deserialize::<Session>(&payload)
            .ok()
            .filter(|session| !session.credential.is_empty())
    }
}
