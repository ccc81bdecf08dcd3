//! Node identity and workload claims.
//!
//! The node consumes signed claims produced elsewhere; it never issues them.
//! A claims token is `base64url(claims-json) "." base64url(signature)` with
//! the issuer's ed25519 verifying key carried hex-encoded inside the claims,
//! and the signature computed over the raw claims JSON.
//!
//! The workload environment travels as an AEAD envelope addressed to the
//! node's curve (x25519) public key: an ephemeral key agreement feeds a
//! SHA-256 KDF whose output keys AES-256-GCM.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::NodeError;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

// =============================================================================
// Node identity
// =============================================================================

/// The node's process-lifetime key material.
///
/// The signing public key doubles as the node id; the curve public key is
/// published in INFO responses as the recipient for encrypted deploy
/// environments.
pub struct NodeKeys {
    signing: SigningKey,
    curve: StaticSecret,
    public_key: String,
    xkey_public: String,
}

impl NodeKeys {
    /// Generate fresh keys. Called once at startup.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let curve = StaticSecret::random_from_rng(OsRng);
        let public_key = hex::encode(signing.verifying_key().to_bytes());
        let xkey_public = hex::encode(PublicKey::from(&curve).to_bytes());

        Self {
            signing,
            curve,
            public_key,
            xkey_public,
        }
    }

    /// The node id: hex of the ed25519 verifying key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Hex of the curve public key, the deploy-encryption recipient.
    pub fn xkey_public(&self) -> &str {
        &self.xkey_public
    }
}

// =============================================================================
// Claims
// =============================================================================

/// Common shape of signed token payloads: each carries its issuer key.
pub trait IssuedClaims {
    fn issuer(&self) -> &str;
}

/// A verified, decoded workload claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadClaims {
    /// Workload name.
    pub subject: String,

    /// Hex-encoded ed25519 verifying key of the issuer.
    pub issuer: String,

    /// Expected hex SHA-256 of the workload artifact.
    pub hash: String,

    /// URL of the artifact in the remote object store.
    pub location: String,

    /// Workload type tag.
    pub workload_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_subjects: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,

    /// Unix seconds at issuance.
    pub issued_at: i64,
}

impl IssuedClaims for WorkloadClaims {
    fn issuer(&self) -> &str {
        &self.issuer
    }
}

/// Claims on a stop request, signed by the workload's issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopClaims {
    /// Workload name being stopped.
    pub subject: String,

    /// Hex-encoded ed25519 verifying key of the issuer.
    pub issuer: String,

    /// VM id the stop targets.
    pub workload_id: String,

    /// Unix seconds at issuance.
    pub issued_at: i64,
}

impl IssuedClaims for StopClaims {
    fn issuer(&self) -> &str {
        &self.issuer
    }
}

impl StopClaims {
    /// Check a verified stop claim against the deployment it targets.
    pub fn validate_against(&self, deploy: &WorkloadClaims) -> Result<(), NodeError> {
        if self.issuer != deploy.issuer {
            return Err(NodeError::ClaimValidation(
                "stop request issuer does not match workload issuer".to_string(),
            ));
        }

        if self.subject != deploy.subject {
            return Err(NodeError::ClaimValidation(
                "stop request subject does not match workload".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Token encode / verify
// =============================================================================

/// An issuer keypair. The node only uses this in tests and dev tooling;
/// production claims are minted by the operator's control machinery.
pub struct IssuerKey {
    signing: SigningKey,
}

impl IssuerKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Hex of the verifying key; what claims carry as `issuer`.
    pub fn public_key(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// Sign a claims payload into a token. The payload's issuer field must be
    /// this key's public form.
    pub fn sign_token<T: Serialize + IssuedClaims>(&self, claims: &T) -> Result<String, NodeError> {
        if claims.issuer() != self.public_key() {
            return Err(NodeError::ClaimValidation(
                "claims issuer does not match signing key".to_string(),
            ));
        }

        let payload = serde_json::to_vec(claims)
            .map_err(|e| NodeError::ClaimValidation(e.to_string()))?;
        let signature = self.signing.sign(&payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Unix seconds now, for claim issuance.
pub fn issued_now() -> i64 {
    Utc::now().timestamp()
}

/// Decode and verify a signed claims token.
///
/// The embedded issuer key verifies the signature; whether that issuer is
/// *acceptable* is a separate policy check against the node configuration.
pub fn verify_token<T: DeserializeOwned + IssuedClaims>(token: &str) -> Result<T, NodeError> {
    let (payload_b64, sig_b64) = token
        .split_once('.')
        .ok_or_else(|| NodeError::ClaimValidation("malformed claims token".to_string()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| NodeError::ClaimValidation("claims payload is not base64".to_string()))?;

    let claims: T = serde_json::from_slice(&payload)
        .map_err(|e| NodeError::ClaimValidation(format!("claims payload invalid: {e}")))?;

    let issuer_bytes: [u8; 32] = hex::decode(claims.issuer())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| NodeError::ClaimValidation("issuer key is not a valid key".to_string()))?;

    let issuer = VerifyingKey::from_bytes(&issuer_bytes)
        .map_err(|_| NodeError::ClaimValidation("issuer key is not a valid key".to_string()))?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| NodeError::ClaimValidation("signature is not base64".to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| NodeError::ClaimValidation("signature has wrong length".to_string()))?;

    issuer
        .verify(&payload, &signature)
        .map_err(|_| NodeError::ClaimValidation("signature verification failed".to_string()))?;

    Ok(claims)
}

// =============================================================================
// Encrypted environment envelope
// =============================================================================

/// Workload environment sealed to the node's curve public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Hex-encoded ephemeral x25519 public key.
    pub ephemeral_public_key: String,

    /// Base64 AES-GCM nonce.
    pub nonce: String,

    /// Base64 ciphertext.
    pub ciphertext: String,
}

impl EncryptedEnvelope {
    /// An envelope over an empty environment, for workloads with none.
    pub fn seal_empty(recipient_xkey_hex: &str) -> Result<Self, NodeError> {
        seal_environment(&HashMap::new(), recipient_xkey_hex)
    }
}

fn derive_key(shared: &[u8; 32]) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(shared);
    *Key::<Aes256Gcm>::from_slice(digest.as_slice())
}

/// Seal an environment map to a recipient curve public key.
///
/// The node only needs this for tests and dev tooling; deploy senders seal on
/// their side.
pub fn seal_environment(
    environment: &HashMap<String, String>,
    recipient_xkey_hex: &str,
) -> Result<EncryptedEnvelope, NodeError> {
    let recipient_bytes: [u8; 32] = hex::decode(recipient_xkey_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| NodeError::ClaimValidation("recipient key is not a valid key".to_string()))?;
    let recipient = PublicKey::from(recipient_bytes);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let cipher = Aes256Gcm::new(&derive_key(shared.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let plaintext = serde_json::to_vec(environment)
        .map_err(|e| NodeError::ClaimValidation(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| NodeError::ClaimValidation("environment encryption failed".to_string()))?;

    Ok(EncryptedEnvelope {
        ephemeral_public_key: hex::encode(ephemeral_public.to_bytes()),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Open an environment envelope with the node's curve key.
pub fn open_environment(
    envelope: &EncryptedEnvelope,
    keys: &NodeKeys,
) -> Result<HashMap<String, String>, NodeError> {
    let ephemeral_bytes: [u8; 32] = hex::decode(&envelope.ephemeral_public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            NodeError::ClaimValidation("envelope ephemeral key is not a valid key".to_string())
        })?;

    let shared = keys.curve.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    let cipher = Aes256Gcm::new(&derive_key(shared.as_bytes()));

    let nonce = STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| NodeError::ClaimValidation("envelope nonce is not base64".to_string()))?;
    if nonce.len() != NONCE_LEN {
        return Err(NodeError::ClaimValidation(
            "envelope nonce has wrong length".to_string(),
        ));
    }

    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| NodeError::ClaimValidation("envelope ciphertext is not base64".to_string()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| {
            NodeError::ClaimValidation("failed to decrypt workload environment".to_string())
        })?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| NodeError::ClaimValidation(format!("environment payload invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_claims(issuer: &IssuerKey) -> WorkloadClaims {
        WorkloadClaims {
            subject: "echo".to_string(),
            issuer: issuer.public_key(),
            hash: "deadbeef".to_string(),
            location: "nats://bucket/echo.wasm".to_string(),
            workload_type: "wasm".to_string(),
            description: None,
            trigger_subjects: Some(vec!["a.b".to_string()]),
            argv: None,
            issued_at: issued_now(),
        }
    }

    #[test]
    fn test_token_round_trip() {
        let issuer = IssuerKey::generate();
        let claims = test_claims(&issuer);

        let token = issuer.sign_token(&claims).unwrap();
        let decoded: WorkloadClaims = verify_token(&token).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let issuer = IssuerKey::generate();
        let claims = test_claims(&issuer);
        let token = issuer.sign_token(&claims).unwrap();

        let mut forged = test_claims(&issuer);
        forged.subject = "other".to_string();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let sig = token.split_once('.').unwrap().1;
        let tampered = format!("{forged_payload}.{sig}");

        let err = verify_token::<WorkloadClaims>(&tampered).unwrap_err();
        assert!(matches!(err, NodeError::ClaimValidation(_)));
    }

    #[test]
    fn test_signing_with_mismatched_issuer_fails() {
        let issuer = IssuerKey::generate();
        let other = IssuerKey::generate();
        let mut claims = test_claims(&issuer);
        claims.issuer = other.public_key();

        assert!(issuer.sign_token(&claims).is_err());
    }

    #[test]
    fn test_environment_seal_open() {
        let keys = NodeKeys::generate();
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "8080".to_string());

        let envelope = seal_environment(&env, keys.xkey_public()).unwrap();
        let opened = open_environment(&envelope, &keys).unwrap();
        assert_eq!(opened, env);
    }

    #[test]
    fn test_environment_sealed_to_other_node_fails() {
        let keys = NodeKeys::generate();
        let other = NodeKeys::generate();
        let env = HashMap::new();

        let envelope = seal_environment(&env, keys.xkey_public()).unwrap();
        let err = open_environment(&envelope, &other).unwrap_err();
        assert!(matches!(err, NodeError::ClaimValidation(_)));
    }

    #[test]
    fn test_stop_claims_validation() {
        let issuer = IssuerKey::generate();
        let deploy = test_claims(&issuer);

        let stop = StopClaims {
            subject: "echo".to_string(),
            issuer: issuer.public_key(),
            workload_id: "vm-1".to_string(),
            issued_at: issued_now(),
        };
        assert!(stop.validate_against(&deploy).is_ok());

        let wrong_issuer = StopClaims {
            issuer: IssuerKey::generate().public_key(),
            ..stop.clone()
        };
        assert!(wrong_issuer.validate_against(&deploy).is_err());

        let wrong_subject = StopClaims {
            subject: "other".to_string(),
            ..stop
        };
        assert!(wrong_subject.validate_against(&deploy).is_err());
    }
}
