//! Signature verification and device-key resolution.
//!
//! Verification never drops an envelope: the outcome is a
//! [`TrustAnnotation`] and downstream accounting keeps *unsigned*,
//! *failed*, and *verified* in separate counters.
//!
//! Keys are resolved cache-first, then from the remote device-identity
//! service, then from the static fallback map.  Both positive and negative
//! lookups are cached; the negative TTL is deliberately shorter so a key
//! that is still rolling in is discovered quickly.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use ring::signature::{ECDSA_P256_SHA256_ASN1, ED25519, UnparsedPublicKey, VerificationAlgorithm};
use roast_protocol::{Envelope, TrustAnnotation, TrustFailure};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const POSITIVE_TTL: Duration = Duration::from_secs(300);
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// Signature algorithms a device key can carry, selected by key metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
}

impl KeyAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ed25519" => Some(Self::Ed25519),
            "ecdsa-p256" => Some(Self::EcdsaP256),
            _ => None,
        }
    }

    fn verification(self) -> &'static dyn VerificationAlgorithm {
        match self {
            Self::Ed25519 => &ED25519,
            Self::EcdsaP256 => &ECDSA_P256_SHA256_ASN1,
        }
    }
}

/// A resolved device public key.
#[derive(Debug, Clone)]
pub struct DeviceKey {
    pub kid: String,
    pub algorithm: KeyAlgorithm,
    /// SubjectPublicKeyInfo, DER.
    pub spki: Vec<u8>,
    pub revoked_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    key: Option<DeviceKey>,
    expires_at: Instant,
}

/// Positive/negative lookup cache.  Short critical sections only; the lock
/// is never held across an await.
struct KeyCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl KeyCache {
    fn new(positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            positive_ttl,
            negative_ttl,
        }
    }

    /// `Some(outcome)` when a live entry exists; `None` means resolve anew.
    fn get(&self, kid: &str) -> Option<Option<DeviceKey>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(kid)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.key.clone())
    }

    fn put(&self, kid: &str, key: Option<DeviceKey>) {
        let ttl = if key.is_some() {
            self.positive_ttl
        } else {
            self.negative_ttl
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            kid.to_owned(),
            CacheEntry {
                key,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Wire shape served by the device-identity service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDeviceKey {
    kid: String,
    algorithm: String,
    public_key_spki_base64: String,
    #[serde(default)]
    revoked_at: Option<DateTime<Utc>>,
}

/// Resolves `kid`s to device keys: cache, then the remote identity service,
/// then the static fallback map.
pub struct KeyResolver {
    cache: KeyCache,
    http: reqwest::Client,
    identity_url: Option<String>,
    static_keys: HashMap<String, DeviceKey>,
}

impl KeyResolver {
    pub fn new(identity_url: Option<String>, static_keys_json: Option<&str>) -> Self {
        Self {
            cache: KeyCache::new(POSITIVE_TTL, NEGATIVE_TTL),
            http: reqwest::Client::new(),
            identity_url,
            static_keys: parse_static_keys(static_keys_json),
        }
    }

    pub async fn resolve(&self, kid: &str) -> Option<DeviceKey> {
        if let Some(cached) = self.cache.get(kid) {
            return cached;
        }
        let resolved = match self.resolve_remote(kid).await {
            RemoteLookup::Found(key) => Some(key),
            RemoteLookup::NotFound => None,
            RemoteLookup::Unavailable => self.static_keys.get(kid).cloned(),
        };
        self.cache.put(kid, resolved.clone());
        resolved
    }

    async fn resolve_remote(&self, kid: &str) -> RemoteLookup {
        let Some(base) = &self.identity_url else {
            return RemoteLookup::Unavailable;
        };
        let url = format!("{}/v1/device-keys/{kid}", base.trim_end_matches('/'));
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(kid, error = %e, "device-identity lookup failed");
                return RemoteLookup::Unavailable;
            }
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return RemoteLookup::NotFound;
        }
        if !response.status().is_success() {
            debug!(kid, status = %response.status(), "device-identity lookup error");
            return RemoteLookup::Unavailable;
        }
        let wire: WireDeviceKey = match response.json().await {
            Ok(w) => w,
            Err(e) => {
                warn!(kid, error = %e, "device-identity returned an unreadable key");
                return RemoteLookup::Unavailable;
            }
        };
        let Some(algorithm) = KeyAlgorithm::parse(&wire.algorithm) else {
            warn!(kid, algorithm = %wire.algorithm, "unsupported key algorithm");
            return RemoteLookup::NotFound;
        };
        let Ok(spki) = BASE64.decode(&wire.public_key_spki_base64) else {
            warn!(kid, "device-identity key is not valid base64");
            return RemoteLookup::NotFound;
        };
        RemoteLookup::Found(DeviceKey {
            kid: wire.kid,
            algorithm,
            spki,
            revoked_at: wire.revoked_at,
        })
    }
}

enum RemoteLookup {
    Found(DeviceKey),
    NotFound,
    Unavailable,
}

/// Parse `INGESTION_DEVICE_KEYS_JSON`: a map kid -> SPKI-base64.  The
/// algorithm is inferred from the SPKI length (Ed25519 SPKI is always 44
/// bytes; anything longer is treated as P-256).
fn parse_static_keys(json: Option<&str>) -> HashMap<String, DeviceKey> {
    let Some(json) = json else {
        return HashMap::new();
    };
    let parsed: HashMap<String, String> = match serde_json::from_str(json) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "ignoring unparseable INGESTION_DEVICE_KEYS_JSON");
            return HashMap::new();
        }
    };
    parsed
        .into_iter()
        .filter_map(|(kid, spki_b64)| {
            let spki = match BASE64.decode(&spki_b64) {
                Ok(b) => b,
                Err(e) => {
                    warn!(kid = %kid, error = %e, "ignoring static key with invalid base64");
                    return None;
                }
            };
            let algorithm = if spki.len() == ED25519_SPKI_LEN {
                KeyAlgorithm::Ed25519
            } else {
                KeyAlgorithm::EcdsaP256
            };
            Some((
                kid.clone(),
                DeviceKey {
                    kid,
                    algorithm,
                    spki,
                    revoked_at: None,
                },
            ))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

const ED25519_SPKI_LEN: usize = 44;
const ED25519_KEY_LEN: usize = 32;
const P256_SPKI_LEN: usize = 91;
const P256_POINT_LEN: usize = 65;

/// Extract the raw public-key bytes from a DER SPKI.  Both supported
/// algorithms have fixed-size SPKI encodings, so the key is the tail of the
/// document; the leading byte of a P-256 point must be 0x04 (uncompressed).
fn spki_key_bytes(algorithm: KeyAlgorithm, spki: &[u8]) -> Option<&[u8]> {
    match algorithm {
        KeyAlgorithm::Ed25519 if spki.len() == ED25519_SPKI_LEN => {
            Some(&spki[ED25519_SPKI_LEN - ED25519_KEY_LEN..])
        }
        KeyAlgorithm::EcdsaP256 if spki.len() == P256_SPKI_LEN => {
            let point = &spki[P256_SPKI_LEN - P256_POINT_LEN..];
            (point[0] == 0x04).then_some(point)
        }
        _ => None,
    }
}

/// Canonical signing bytes for a wire object: the JSON document with the
/// `sig` member removed and every object's keys emitted in sorted order,
/// compact encoding, UTF-8.  This must match the signer byte-for-byte.
pub fn canonical_signing_bytes(raw: &serde_json::Value) -> Vec<u8> {
    let mut value = raw.clone();
    if let Some(object) = value.as_object_mut() {
        object.remove("sig");
    }
    let mut out = String::new();
    write_canonical(&value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Produce the trust annotation for one envelope.  Never fails the
/// pipeline; every outcome is an annotation.
pub async fn verify_envelope(resolver: &KeyResolver, envelope: &Envelope) -> TrustAnnotation {
    let Some(sig_b64) = &envelope.sig else {
        return TrustAnnotation::failed(TrustFailure::MissingSig, None);
    };
    let Some(kid) = &envelope.kid else {
        return TrustAnnotation::failed(TrustFailure::MissingKid, None);
    };
    let Some(key) = resolver.resolve(kid).await else {
        return TrustAnnotation::failed(TrustFailure::UnknownKid, Some(kid.clone()));
    };
    if key.revoked_at.is_some() {
        return TrustAnnotation::failed(TrustFailure::RevokedKey, Some(kid.clone()));
    }
    let Ok(signature) = BASE64.decode(sig_b64) else {
        return TrustAnnotation::failed(TrustFailure::BadSignature, Some(kid.clone()));
    };
    let Some(key_bytes) = spki_key_bytes(key.algorithm, &key.spki) else {
        warn!(kid = %kid, "device key has a malformed SPKI");
        return TrustAnnotation::failed(TrustFailure::BadSignature, Some(kid.clone()));
    };

    let message = canonical_signing_bytes(&envelope.raw);
    let public_key = UnparsedPublicKey::new(key.algorithm.verification(), key_bytes);
    match public_key.verify(&message, &signature) {
        Ok(()) => TrustAnnotation::verified(kid.clone()),
        Err(_) => TrustAnnotation::failed(TrustFailure::BadSignature, Some(kid.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode_at;
    use chrono::TimeZone;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    /// DER prefix for an Ed25519 SubjectPublicKeyInfo.
    const ED25519_SPKI_PREFIX: [u8; 12] = [
        0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
    ];

    fn test_keypair() -> (Ed25519KeyPair, String) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate");
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("parse");
        let mut spki = ED25519_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(pair.public_key().as_ref());
        (pair, BASE64.encode(spki))
    }

    fn resolver_with(kid: &str, spki_b64: &str) -> KeyResolver {
        let json = serde_json::json!({ kid: spki_b64 }).to_string();
        KeyResolver::new(None, Some(&json))
    }

    fn decode_envelope(payload: &str) -> Envelope {
        decode_at(
            "roaster/acme/plant-1/r2/telemetry",
            payload.as_bytes(),
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        )
        .expect("decode")
    }

    #[test]
    fn canonical_bytes_sort_keys_and_drop_sig() {
        let a: serde_json::Value = serde_json::from_str(
            r#"{"machineId":"r2","elapsedSeconds":1.5,"sig":"abc","btC":100.0}"#,
        )
        .unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"btC":100.0,"elapsedSeconds":1.5,"machineId":"r2"}"#).unwrap();
        assert_eq!(canonical_signing_bytes(&a), canonical_signing_bytes(&b));
        assert_eq!(
            canonical_signing_bytes(&b),
            br#"{"btC":100.0,"elapsedSeconds":1.5,"machineId":"r2"}"#.to_vec()
        );
    }

    #[tokio::test]
    async fn unsigned_envelope_annotates_missing_sig() {
        let envelope = decode_envelope(r#"{"elapsedSeconds":1.0}"#);
        let (_, spki) = test_keypair();
        let annotation = verify_envelope(&resolver_with("k1", &spki), &envelope).await;
        assert!(!annotation.verified);
        assert_eq!(annotation.reason, Some(TrustFailure::MissingSig));
        assert!(annotation.is_unsigned());
    }

    #[tokio::test]
    async fn sig_without_kid_annotates_missing_kid() {
        let envelope = decode_envelope(r#"{"elapsedSeconds":1.0,"sig":"c2ln"}"#);
        let (_, spki) = test_keypair();
        let annotation = verify_envelope(&resolver_with("k1", &spki), &envelope).await;
        assert_eq!(annotation.reason, Some(TrustFailure::MissingKid));
    }

    #[tokio::test]
    async fn unknown_kid_is_annotated_not_dropped() {
        let envelope = decode_envelope(r#"{"elapsedSeconds":1.0,"sig":"c2ln","kid":"ghost"}"#);
        let resolver = KeyResolver::new(None, None);
        let annotation = verify_envelope(&resolver, &envelope).await;
        assert_eq!(annotation.reason, Some(TrustFailure::UnknownKid));
        assert_eq!(annotation.kid.as_deref(), Some("ghost"));
    }

    #[tokio::test]
    async fn valid_ed25519_signature_verifies() {
        let (pair, spki) = test_keypair();
        let unsigned = serde_json::json!({
            "elapsedSeconds": 10.0,
            "btC": 151.2,
            "kid": "machine-key-1",
        });
        let sig = pair.sign(&canonical_signing_bytes(&unsigned));
        let mut wire = unsigned;
        wire["sig"] = serde_json::json!(BASE64.encode(sig.as_ref()));

        let envelope = decode_envelope(&wire.to_string());
        let resolver = resolver_with("machine-key-1", &spki);
        let annotation = verify_envelope(&resolver, &envelope).await;
        assert!(annotation.verified, "got {annotation:?}");
        assert_eq!(annotation.kid.as_deref(), Some("machine-key-1"));
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let (pair, spki) = test_keypair();
        let unsigned = serde_json::json!({
            "elapsedSeconds": 10.0,
            "btC": 151.2,
            "kid": "machine-key-1",
        });
        let sig = pair.sign(&canonical_signing_bytes(&unsigned));
        let mut wire = unsigned;
        wire["sig"] = serde_json::json!(BASE64.encode(sig.as_ref()));
        wire["btC"] = serde_json::json!(500.0);

        let envelope = decode_envelope(&wire.to_string());
        let resolver = resolver_with("machine-key-1", &spki);
        let annotation = verify_envelope(&resolver, &envelope).await;
        assert!(!annotation.verified);
        assert_eq!(annotation.reason, Some(TrustFailure::BadSignature));
        assert_eq!(annotation.kid.as_deref(), Some("machine-key-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_cache_entries_expire_faster_than_positive() {
        let cache = KeyCache::new(Duration::from_secs(300), Duration::from_secs(30));
        let key = DeviceKey {
            kid: "k1".to_owned(),
            algorithm: KeyAlgorithm::Ed25519,
            spki: vec![0; ED25519_SPKI_LEN],
            revoked_at: None,
        };
        cache.put("hit", Some(key));
        cache.put("miss", None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("hit").is_some(), "positive entry still live");
        assert!(cache.get("miss").is_none(), "negative entry expired");

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(cache.get("hit").is_none(), "positive entry expired");
    }

    #[test]
    fn spki_tail_extraction_validates_shape() {
        let mut ed = vec![0u8; ED25519_SPKI_LEN];
        ed[ED25519_SPKI_LEN - 1] = 0xAA;
        let bytes = spki_key_bytes(KeyAlgorithm::Ed25519, &ed).expect("valid length");
        assert_eq!(bytes.len(), ED25519_KEY_LEN);
        assert_eq!(bytes[ED25519_KEY_LEN - 1], 0xAA);

        assert!(spki_key_bytes(KeyAlgorithm::Ed25519, &[0u8; 10]).is_none());

        let mut p256 = vec![0u8; P256_SPKI_LEN];
        p256[P256_SPKI_LEN - P256_POINT_LEN] = 0x04;
        assert!(spki_key_bytes(KeyAlgorithm::EcdsaP256, &p256).is_some());
        p256[P256_SPKI_LEN - P256_POINT_LEN] = 0x02;
        assert!(
            spki_key_bytes(KeyAlgorithm::EcdsaP256, &p256).is_none(),
            "compressed points are rejected"
        );
    }
}
