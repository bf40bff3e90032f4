// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Image verification gate (SHA-256 digest + ECDSA P-256 signature)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + tamper scenarios in tests/ota_pal_host
//!
//! The gate checks a detached `sig-sha256-ecdsa` signature against the digest
//! of a staged image. Public keys are resolved through the [`KeyProvider`]
//! capability; every sub-step failure (key lookup, signature decode, curve
//! math) is an equally hard rejection. A partially verified image is never
//! trusted.
//!
//! ADR: docs/adr/0031-ota-dual-bank-pal.md

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use thiserror::Error;

pub use p256::ecdsa::VerifyingKey as PublicKey;

/// Errors produced by the verification gate.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// No key material is registered under the requested label.
    #[error("public key not found: {0}")]
    KeyNotFound(String),
    /// Key material exists but is malformed.
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    /// Signature bytes are neither ASN.1 DER nor raw `r||s`.
    #[error("malformed signature encoding")]
    MalformedSignature,
    /// Signature does not match the image digest.
    #[error("signature verification failed")]
    SignatureMismatch,
    /// I/O failure while resolving key material.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability resolving a logical key label to public key material.
///
/// One implementation per credential backend; the gate treats any resolution
/// failure as a verification failure.
pub trait KeyProvider {
    fn load_public_key(&self, label: &str) -> Result<PublicKey, VerifyError>;
}

/// In-memory label-to-key map.
#[derive(Default)]
pub struct MemKeyProvider {
    keys: BTreeMap<String, PublicKey>,
}

impl MemKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, key: PublicKey) {
        self.keys.insert(label.into(), key);
    }
}

impl KeyProvider for MemKeyProvider {
    fn load_public_key(&self, label: &str) -> Result<PublicKey, VerifyError> {
        self.keys.get(label).cloned().ok_or_else(|| VerifyError::KeyNotFound(label.to_string()))
    }
}

/// Key provider backed by `<label>.pub` files in one directory, holding
/// either a PEM (SPKI) block or a hex-encoded SEC1 point.
pub struct DirKeyProvider {
    dir: PathBuf,
}

impl DirKeyProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl KeyProvider for DirKeyProvider {
    fn load_public_key(&self, label: &str) -> Result<PublicKey, VerifyError> {
        // Labels are logical names, never paths.
        if label.is_empty() || label.contains(['/', '\\']) || label.contains("..") {
            return Err(VerifyError::InvalidKey(format!("unsafe key label: {label}")));
        }
        let path = self.dir.join(format!("{label}.pub"));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VerifyError::KeyNotFound(label.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let trimmed = contents.trim();
        if trimmed.contains("-----BEGIN PUBLIC KEY-----") {
            VerifyingKey::from_public_key_pem(trimmed)
                .map_err(|err| VerifyError::InvalidKey(err.to_string()))
        } else {
            parse_hex_key(trimmed)
        }
    }
}

fn parse_hex_key(input: &str) -> Result<PublicKey, VerifyError> {
    let filtered: String = input.chars().filter(|ch| !ch.is_ascii_whitespace()).collect();
    if filtered.is_empty() {
        return Err(VerifyError::InvalidKey("empty key material".into()));
    }
    let bytes = hex::decode(&filtered)
        .map_err(|err| VerifyError::InvalidKey(format!("failed to decode hex: {err}")))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|err| VerifyError::InvalidKey(err.to_string()))
}

/// Checks a detached signature against a precomputed image digest.
pub fn verify_digest_signature(
    key: &PublicKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<(), VerifyError> {
    if signature.is_empty() {
        return Err(VerifyError::MalformedSignature);
    }
    let signature = Signature::from_der(signature)
        .or_else(|_| Signature::from_slice(signature))
        .map_err(|_| VerifyError::MalformedSignature)?;
    key.verify_prehash(digest, &signature).map_err(|_| VerifyError::SignatureMismatch)
}

/// Resolves `label` through `provider` and checks `signature` against
/// `digest`. The single entry point used by the state machine.
pub fn verify_image<K: KeyProvider>(
    provider: &K,
    label: &str,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<(), VerifyError> {
    let key = provider.load_public_key(label)?;
    verify_digest_signature(&key, digest, signature)
}
