//! Signed-encrypted cookie session backend.
//!
//! The record is codec-encoded, encrypted with AES-256-GCM under a key
//! derived from the process secret, wrapped with an outer HMAC-SHA256
//! signature over `iv || tag || ciphertext` under an independently derived
//! signing key, and round-tripped through the `poto_session` cookie on the
//! request/response pair held by the request context. A cookie that fails
//! the signature, decryption, structure, age, or principal checks is
//! treated as absent.

use std::time::Duration;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderValue;
use poto_codec::Codec;
use poto_core::context::RequestContext;
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params as ScryptParams;
use sha2::Sha256;
use tracing::debug;

use crate::backend::SessionBackend;
use crate::{SessionError, SessionRecord, SESSION_COOKIE};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Practical ceiling for one cookie header value.
const MAX_COOKIE_BYTES: usize = 4096;

const ENCRYPTION_SALT: &[u8] = b"encryption-salt";
const SIGNING_SALT: &[u8] = b"signing-salt";

struct DerivedKeys {
    encryption: [u8; KEY_LEN],
    signing: [u8; KEY_LEN],
}

/// Derive the two independent keys from the user-supplied secret.
fn derive_keys(secret: &str) -> Result<DerivedKeys, SessionError> {
    let params = ScryptParams::new(14, 8, 1, KEY_LEN)
        .map_err(|e| SessionError::Crypto(format!("bad scrypt parameters: {e}")))?;

    let mut encryption = [0u8; KEY_LEN];
    scrypt::scrypt(secret.as_bytes(), ENCRYPTION_SALT, &params, &mut encryption)
        .map_err(|e| SessionError::Crypto(format!("key derivation failed: {e}")))?;

    let mut signing = [0u8; KEY_LEN];
    scrypt::scrypt(secret.as_bytes(), SIGNING_SALT, &params, &mut signing)
        .map_err(|e| SessionError::Crypto(format!("key derivation failed: {e}")))?;

    Ok(DerivedKeys {
        encryption,
        signing,
    })
}

/// Cookie session backend. Enumeration and global stats are not supported
/// by construction and report empty results.
pub struct CookieSessionBackend {
    codec: Codec,
    keys: DerivedKeys,
    max_age: Duration,
    secure: bool,
}

impl CookieSessionBackend {
    pub fn new(
        secret: &str,
        codec: Codec,
        max_age: Duration,
        secure: bool,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            codec,
            keys: derive_keys(secret)?,
            max_age,
            secure,
        })
    }

    fn new_hmac(&self) -> Hmac<Sha256> {
        <Hmac<Sha256> as Mac>::new_from_slice(&self.keys.signing)
            .expect("HMAC accepts keys of any length")
    }

    /// Seal a record into the cookie value `signature:iv:tag:ciphertext`.
    fn seal(&self, record: &SessionRecord) -> Result<String, SessionError> {
        let plaintext = self.codec.encode_to_string(&record.to_value())?;

        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.keys.encryption));
        let mut sealed = cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| SessionError::Crypto("encryption failed".into()))?;
        // AES-GCM appends the authentication tag to the ciphertext.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let ciphertext = sealed;

        let mut mac = self.new_hmac();
        mac.update(&iv);
        mac.update(&tag);
        mac.update(&ciphertext);
        let signature = mac.finalize().into_bytes();

        let value = format!(
            "{}:{}:{}:{}",
            BASE64.encode(signature),
            BASE64.encode(iv),
            BASE64.encode(tag),
            BASE64.encode(&ciphertext),
        );
        if value.len() > MAX_COOKIE_BYTES {
            return Err(SessionError::SizeLimit {
                actual: value.len(),
                max: MAX_COOKIE_BYTES,
            });
        }
        Ok(value)
    }

    /// Open a cookie value. Any framing, signature, cipher, or record
    /// shape mismatch yields `None`.
    fn open(&self, value: &str) -> Option<SessionRecord> {
        let mut parts = value.split(':');
        let signature = BASE64.decode(parts.next()?).ok()?;
        let iv = BASE64.decode(parts.next()?).ok()?;
        let tag = BASE64.decode(parts.next()?).ok()?;
        let ciphertext = BASE64.decode(parts.next()?).ok()?;
        if parts.next().is_some() || iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return None;
        }

        let mut mac = self.new_hmac();
        mac.update(&iv);
        mac.update(&tag);
        mac.update(&ciphertext);
        if mac.verify_slice(&signature).is_err() {
            debug!("session cookie failed signature verification");
            return None;
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.keys.encryption));
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plaintext = cipher.decrypt(GenericArray::from_slice(&iv), sealed.as_slice()).ok()?;

        let text = String::from_utf8(plaintext).ok()?;
        let value = self.codec.decode_str(&text).ok()?;
        SessionRecord::from_value(&value)
    }

    fn request_cookie(&self, ctx: &RequestContext) -> Option<String> {
        for header in ctx.request().headers.get_all(COOKIE) {
            let raw = header.to_str().ok()?;
            for pair in raw.split(';') {
                let pair = pair.trim();
                if let Some(value) = pair.strip_prefix(SESSION_COOKIE) {
                    if let Some(value) = value.strip_prefix('=') {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }

    fn write_cookie(&self, ctx: &RequestContext, value: &str, max_age_secs: u64) {
        let mut cookie = format!(
            "{SESSION_COOKIE}={value}; Max-Age={max_age_secs}; Path=/; HttpOnly; SameSite=Strict"
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Ok(header) = HeaderValue::from_str(&cookie) {
            ctx.insert_response_header(SET_COOKIE, header);
        }
    }
}

#[async_trait]
impl SessionBackend for CookieSessionBackend {
    async fn load(
        &self,
        ctx: &RequestContext,
        principal_id: &str,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let Some(raw) = self.request_cookie(ctx) else {
            return Ok(None);
        };
        let Some(record) = self.open(&raw) else {
            return Ok(None);
        };
        if record.principal_id != principal_id {
            // A cookie minted for a different principal: fixation attempt
            // or stale client state.
            debug!(
                cookie_principal = %record.principal_id,
                request_principal = %principal_id,
                "rejecting session cookie with mismatched principal"
            );
            return Ok(None);
        }
        if record.idle_age(Utc::now()) > self.max_age {
            debug!(principal = principal_id, "rejecting expired session cookie");
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn store(
        &self,
        ctx: &RequestContext,
        mut record: SessionRecord,
    ) -> Result<(), SessionError> {
        record.touch();
        let value = self.seal(&record)?;
        self.write_cookie(ctx, &value, self.max_age.as_secs());
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        _principal_id: &str,
    ) -> Result<(), SessionError> {
        self.write_cookie(ctx, "", 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Uri};
    use poto_codec::Value;
    use poto_core::context::RequestInfo;
    use poto_core::Principal;
    use std::sync::Arc;

    fn backend() -> CookieSessionBackend {
        CookieSessionBackend::new(
            "test-secret",
            Codec::default(),
            Duration::from_secs(3600),
            false,
        )
        .unwrap()
    }

    fn ctx_with_cookie(principal_id: &str, cookie: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(value) = cookie {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&format!("{SESSION_COOKIE}={value}")).unwrap(),
            );
        }
        RequestContext::new(
            Some(Arc::new(Principal::new(principal_id, ["user"]))),
            RequestInfo {
                method: Method::POST,
                uri: Uri::from_static("/x/y"),
                headers,
            },
        )
    }

    fn set_cookie_value(ctx: &RequestContext) -> String {
        let header = ctx.response_headers().get(SET_COOKIE).unwrap().clone();
        let raw = header.to_str().unwrap().to_string();
        let pair = raw.split(';').next().unwrap();
        pair.strip_prefix(&format!("{SESSION_COOKIE}=")).unwrap().to_string()
    }

    #[tokio::test]
    async fn cookie_round_trips_a_record() {
        let backend = backend();
        let write_ctx = ctx_with_cookie("alice", None);
        let mut record = SessionRecord::new("alice");
        record.data.insert("k".into(), Value::string("v"));
        backend.store(&write_ctx, record).await.unwrap();

        let raw = ctx_with_cookie("alice", None);
        assert!(backend.load(&raw, "alice").await.unwrap().is_none());

        let value = set_cookie_value(&write_ctx);
        let read_ctx = ctx_with_cookie("alice", Some(&value));
        let loaded = backend.load(&read_ctx, "alice").await.unwrap().unwrap();
        assert_eq!(loaded.data["k"].as_str(), Some("v"));
    }

    #[tokio::test]
    async fn cookie_attributes_are_emitted() {
        let backend = backend();
        let ctx = ctx_with_cookie("alice", None);
        backend.store(&ctx, SessionRecord::new("alice")).await.unwrap();
        let header = ctx.response_headers().get(SET_COOKIE).unwrap().clone();
        let raw = header.to_str().unwrap();
        assert!(raw.contains("Max-Age=3600"));
        assert!(raw.contains("Path=/"));
        assert!(raw.contains("HttpOnly"));
        assert!(raw.contains("SameSite=Strict"));
        assert!(!raw.contains("Secure"));
    }

    #[tokio::test]
    async fn tampered_cookies_are_treated_as_absent() {
        let backend = backend();
        let write_ctx = ctx_with_cookie("alice", None);
        let mut record = SessionRecord::new("alice");
        record.data.insert("k".into(), Value::int(1));
        backend.store(&write_ctx, record).await.unwrap();
        let value = set_cookie_value(&write_ctx);

        // Flip one byte in every segment in turn.
        for segment_index in 0..4 {
            let mut segments: Vec<String> =
                value.split(':').map(String::from).collect();
            let decoded = BASE64.decode(&segments[segment_index]).unwrap();
            let mut bytes = decoded.clone();
            bytes[0] ^= 0x01;
            segments[segment_index] = BASE64.encode(&bytes);
            let tampered = segments.join(":");

            let ctx = ctx_with_cookie("alice", Some(&tampered));
            assert!(
                backend.load(&ctx, "alice").await.unwrap().is_none(),
                "segment {segment_index} tamper was accepted"
            );
        }
    }

    #[tokio::test]
    async fn mismatched_principal_is_rejected() {
        let backend = backend();
        let write_ctx = ctx_with_cookie("alice", None);
        backend
            .store(&write_ctx, SessionRecord::new("alice"))
            .await
            .unwrap();
        let value = set_cookie_value(&write_ctx);
        let mallory_ctx = ctx_with_cookie("mallory", Some(&value));
        assert!(backend.load(&mallory_ctx, "mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_records_are_rejected() {
        let backend = CookieSessionBackend::new(
            "test-secret",
            Codec::default(),
            Duration::from_secs(0),
            false,
        )
        .unwrap();
        let write_ctx = ctx_with_cookie("alice", None);
        backend
            .store(&write_ctx, SessionRecord::new("alice"))
            .await
            .unwrap();
        let value = set_cookie_value(&write_ctx);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let ctx = ctx_with_cookie("alice", Some(&value));
        assert!(backend.load(&ctx, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_writes_an_empty_expiring_cookie() {
        let backend = backend();
        let ctx = ctx_with_cookie("alice", None);
        backend.delete(&ctx, "alice").await.unwrap();
        let header = ctx.response_headers().get(SET_COOKIE).unwrap().clone();
        let raw = header.to_str().unwrap();
        assert!(raw.starts_with(&format!("{SESSION_COOKIE}=;")));
        assert!(raw.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn stats_are_empty_by_construction() {
        let backend = backend();
        let stats = backend.stats();
        assert_eq!(stats.active_sessions, 0);
        assert!(stats.principals.is_empty());
        assert_eq!(backend.cleanup_older_than(Duration::from_secs(1)).await, 0);
    }
}
