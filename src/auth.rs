//! Signature verification — authenticates envelopes issued by the autoscaler
//!
//! The autoscaler signs each routing envelope with its RSA private key; the
//! worker fetches the matching public key at startup and verifies every
//! request. Repeated key-fetch failures permanently downgrade the worker to
//! unsecured operation so it keeps serving rather than rejecting everything.

use crate::config::{MAX_PUBKEY_FETCH_ATTEMPTS, PUBKEY_FETCH_TIMEOUT};
use crate::envelope::AuthData;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::Sha256;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use std::sync::Mutex;

/// How the worker treats request signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Signatures are verified against the autoscaler's public key
    Verifying,
    /// Verification disabled by the operator
    UnsecuredByConfig,
    /// Verification disabled after exhausting key-fetch attempts
    UnsecuredByFallback,
}

impl SecurityMode {
    pub fn is_unsecured(&self) -> bool {
        !matches!(self, Self::Verifying)
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verifying => write!(f, "verifying"),
            Self::UnsecuredByConfig => write!(f, "unsecured-by-config"),
            Self::UnsecuredByFallback => write!(f, "unsecured-by-fallback"),
        }
    }
}

struct VerifierState {
    mode: SecurityMode,
    pubkey: Option<RsaPublicKey>,
    fetch_errors: u32,
}

/// Verifies request signatures against the autoscaler's public key.
pub struct AuthVerifier {
    report_addr: String,
    client: reqwest::Client,
    state: Mutex<VerifierState>,
}

impl AuthVerifier {
    pub fn new(report_addr: &str, unsecured_by_config: bool) -> Self {
        let mode = if unsecured_by_config {
            SecurityMode::UnsecuredByConfig
        } else {
            SecurityMode::Verifying
        };
        let client = reqwest::Client::builder()
            .timeout(PUBKEY_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            report_addr: report_addr.trim_end_matches('/').to_string(),
            client,
            state: Mutex::new(VerifierState {
                mode,
                pubkey: None,
                fetch_errors: 0,
            }),
        }
    }

    pub fn mode(&self) -> SecurityMode {
        self.lock().mode
    }

    /// True when signature checks are bypassed, whether by configuration or
    /// by fallback. Envelope parsing keys its passthrough behavior off this.
    pub fn is_unsecured(&self) -> bool {
        self.lock().mode.is_unsecured()
    }

    /// Eagerly fetch the public key at startup. Failures are tolerated; the
    /// fetch is retried lazily on the next verification.
    pub async fn init(&self) {
        if self.mode() == SecurityMode::Verifying {
            self.fetch_pubkey().await;
        }
    }

    /// Verify an envelope's signature. Never errors: any failure along the
    /// decode/parse/verify path is a plain `false`.
    pub async fn verify(&self, auth: &AuthData) -> bool {
        if self.is_unsecured() {
            return true;
        }

        let pubkey = match self.cached_pubkey() {
            Some(key) => Some(key),
            None => self.fetch_pubkey().await,
        };
        let pubkey = match pubkey {
            Some(key) => key,
            None => return false,
        };

        let message = canonical_message(auth);
        verify_signature(&pubkey, &message, &auth.signature)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VerifierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_pubkey(&self) -> Option<RsaPublicKey> {
        self.lock().pubkey.clone()
    }

    /// Fetch the key from the autoscaler. After `MAX_PUBKEY_FETCH_ATTEMPTS`
    /// total failures the worker downgrades to unsecured mode for good.
    async fn fetch_pubkey(&self) -> Option<RsaPublicKey> {
        let url = format!("{}/pubkey", self.report_addr);
        let fetched = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(pem) => parse_public_key(&pem),
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read pubkey response");
                    None
                }
            },
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "Pubkey fetch returned error status");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "Pubkey fetch failed");
                None
            }
        };

        let mut state = self.lock();
        match fetched {
            Some(key) => {
                tracing::info!("Autoscaler public key fetched");
                state.pubkey = Some(key.clone());
                Some(key)
            }
            None => {
                state.fetch_errors += 1;
                if state.fetch_errors >= MAX_PUBKEY_FETCH_ATTEMPTS
                    && state.mode == SecurityMode::Verifying
                {
                    state.mode = SecurityMode::UnsecuredByFallback;
                    tracing::warn!(
                        attempts = state.fetch_errors,
                        "Max pubkey fetch attempts reached, downgrading to unsecured mode"
                    );
                }
                None
            }
        }
    }
}

/// Canonical signed message for an envelope.
///
/// Byte-for-byte the autoscaler's encoding: JSON object with keys
/// `cost, endpoint, reqnum, request_idx, url` (lexicographic), `": "` and
/// `", "` separators, `signature` excluded, `cost` in its original JSON
/// form. Do not swap this for compact serialization; the spacing is part
/// of the signed bytes.
///
/// Known encoding limits: exponent-form costs render as `1e30` here versus
/// `1e+30` from Python's `json.dumps`, and non-ASCII endpoint/url characters
/// are emitted verbatim rather than `\uXXXX`-escaped. The autoscaler signs
/// plain decimal costs and ASCII URLs, so neither form occurs in practice.
pub fn canonical_message(auth: &AuthData) -> String {
    let encode = |v: &serde_json::Value| serde_json::to_string(v).unwrap_or_default();
    format!(
        "{{\"cost\": {}, \"endpoint\": {}, \"reqnum\": {}, \"request_idx\": {}, \"url\": {}}}",
        encode(&auth.cost),
        encode(&serde_json::Value::from(auth.endpoint.as_str())),
        auth.reqnum,
        auth.request_idx,
        encode(&serde_json::Value::from(auth.url.as_str())),
    )
}

/// Parse a PEM public key in either SPKI or PKCS#1 form.
fn parse_public_key(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| {
            tracing::debug!(error = %e, "Failed to parse public key");
            e
        })
        .ok()
}

/// PKCS#1 v1.5 / SHA-256 verification of a base64 signature.
fn verify_signature(pubkey: &RsaPublicKey, message: &str, signature_b64: &str) -> bool {
    let sig_bytes = match BASE64.decode(signature_b64) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "Signature is not valid base64");
            return false;
        }
    };
    let signature = match Signature::try_from(sig_bytes.as_slice()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::debug!(error = %e, "Signature has invalid structure");
            return false;
        }
    };
    let verifying_key = VerifyingKey::<Sha256>::new(pubkey.clone());
    match verifying_key.verify(message.as_bytes(), &signature) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Signature verification failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::SigningKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;
    use serde_json::Value;

    fn test_auth(cost: Value) -> AuthData {
        AuthData {
            cost,
            endpoint: "/v1/completions".to_string(),
            reqnum: 42,
            request_idx: 7,
            signature: String::new(),
            url: "https://worker:3000".to_string(),
        }
    }

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public = private.to_public_key();
        (private, public)
    }

    fn sign(private: &RsaPrivateKey, message: &str) -> String {
        let signing_key = SigningKey::<Sha256>::new(private.clone());
        BASE64.encode(signing_key.sign(message.as_bytes()).to_bytes())
    }

    #[test]
    fn test_canonical_message_string_cost() {
        // Matches Python json.dumps(..., sort_keys=True) byte for byte
        let auth = test_auth(Value::from("5.0"));
        assert_eq!(
            canonical_message(&auth),
            r#"{"cost": "5.0", "endpoint": "/v1/completions", "reqnum": 42, "request_idx": 7, "url": "https://worker:3000"}"#
        );
    }

    #[test]
    fn test_canonical_message_numeric_cost() {
        let auth = test_auth(serde_json::json!(5.0));
        assert!(canonical_message(&auth).starts_with(r#"{"cost": 5.0, "#));
        let auth = test_auth(serde_json::json!(5));
        assert!(canonical_message(&auth).starts_with(r#"{"cost": 5, "#));
    }

    #[test]
    fn test_canonical_message_excludes_signature() {
        let mut auth = test_auth(Value::from("1.0"));
        auth.signature = "anything".to_string();
        let with_sig = canonical_message(&auth);
        auth.signature = String::new();
        assert_eq!(with_sig, canonical_message(&auth));
    }

    #[test]
    fn test_signature_round_trip() {
        let (private, public) = keypair();
        let auth = test_auth(Value::from("5.0"));
        let message = canonical_message(&auth);
        let signature = sign(&private, &message);
        assert!(verify_signature(&public, &message, &signature));
    }

    #[test]
    fn test_tampered_message_fails() {
        let (private, public) = keypair();
        let auth = test_auth(Value::from("5.0"));
        let signature = sign(&private, &canonical_message(&auth));

        let mut tampered = test_auth(Value::from("500.0"));
        tampered.signature = signature.clone();
        assert!(!verify_signature(
            &public,
            &canonical_message(&tampered),
            &signature
        ));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let (private, public) = keypair();
        let message = canonical_message(&test_auth(Value::from("5.0")));
        let signature = sign(&private, &message);
        let mut raw = BASE64.decode(&signature).unwrap();
        raw[0] ^= 0x01;
        assert!(!verify_signature(&public, &message, &BASE64.encode(raw)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (private, _) = keypair();
        let (_, other_public) = keypair();
        let message = canonical_message(&test_auth(Value::from("5.0")));
        let signature = sign(&private, &message);
        assert!(!verify_signature(&other_public, &message, &signature));
    }

    #[test]
    fn test_garbage_signature_fails_without_panic() {
        let (_, public) = keypair();
        assert!(!verify_signature(&public, "msg", "not base64 !!!"));
        assert!(!verify_signature(&public, "msg", "c2hvcnQ="));
    }

    #[tokio::test]
    async fn test_unsecured_by_config_always_verifies() {
        let verifier = AuthVerifier::new("http://127.0.0.1:1", true);
        assert_eq!(verifier.mode(), SecurityMode::UnsecuredByConfig);
        let mut auth = test_auth(Value::from("1.0"));
        auth.signature = "garbage".to_string();
        assert!(verifier.verify(&auth).await);
    }

    #[tokio::test]
    async fn test_fallback_downgrade_after_fetch_failures() {
        // Port 1 refuses connections immediately
        let verifier = AuthVerifier::new("http://127.0.0.1:1", false);
        let auth = test_auth(Value::from("1.0"));

        for _ in 0..MAX_PUBKEY_FETCH_ATTEMPTS {
            assert_eq!(verifier.mode(), SecurityMode::Verifying);
            // Key unavailable while still verifying: signature check fails
            assert!(!verifier.verify(&auth).await);
        }

        assert_eq!(verifier.mode(), SecurityMode::UnsecuredByFallback);
        assert!(verifier.verify(&auth).await);
    }
}
