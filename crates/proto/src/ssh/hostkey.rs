//! SSH host keys and host key verification.
//!
//! The server proves its identity by signing the exchange hash with its host
//! key (RFC 4253 Section 8). This module holds the server-side signing keys,
//! the client-side signature check, and the [`HostKeyVerifier`] policy the
//! client consults before trusting a key.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519 (RFC 8709)
//! - `ecdsa-sha2-nistp256` - ECDSA on P-256 with SHA-256 (RFC 5656)
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::hostkey::{verify_signature, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_bytes();
//! let signature = hostkey.sign(b"exchange hash")?;
//!
//! assert!(verify_signature(&blob, b"exchange hash", &signature)?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use strand_platform::{StrandError, StrandResult};
use zeroize::Zeroizing;

use super::wire::{encode_mpint, write_bytes, write_string, WireReader};

/// SSH host key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            _ => None,
        }
    }
}

/// Server host key used to sign the exchange hash.
pub trait HostKey: Send + Sync {
    /// Returns the host key algorithm.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Returns the public key blob in SSH wire format.
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Signs `data` and returns the SSH signature blob.
    fn sign(&self, data: &[u8]) -> StrandResult<Vec<u8>>;

    /// Returns the algorithm name.
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

fn signature_blob(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, signature);
    buf.to_vec()
}

/// Ed25519 host key.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a new random key.
    pub fn generate() -> StrandResult<Self> {
        let mut csprng = rand::thread_rng();
        let secret_bytes: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut csprng));
        Self::from_bytes(&secret_bytes[..])
    }

    /// Builds a key from its 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> StrandResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            StrandError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Returns the 32-byte secret.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Verifies a raw Ed25519 signature.
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> StrandResult<bool> {
        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            StrandError::Security("Ed25519 public key must be 32 bytes".to_string())
        })?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            StrandError::Security("Ed25519 signature must be 64 bytes".to_string())
        })?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| StrandError::Security(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = Signature::from_bytes(&sig_bytes);

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "ssh-ed25519");
        write_bytes(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> StrandResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob("ssh-ed25519", &signature.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// ECDSA P-256 host key.
pub struct EcdsaP256HostKey {
    signing_key: p256::ecdsa::SigningKey,
    verifying_key: p256::ecdsa::VerifyingKey,
}

impl EcdsaP256HostKey {
    /// Generates a new random key.
    pub fn generate() -> StrandResult<Self> {
        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let verifying_key = p256::ecdsa::VerifyingKey::from(&signing_key);
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Verifies an SSH ECDSA signature (`mpint r || mpint s`) against a
    /// SEC1-encoded public point.
    pub fn verify(public_point: &[u8], data: &[u8], signature: &[u8]) -> StrandResult<bool> {
        use signature::Verifier;

        let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_point)
            .map_err(|e| StrandError::Security(format!("Invalid P-256 public key: {}", e)))?;

        let mut r = WireReader::new(signature);
        let mut raw = [0u8; 64];
        for (i, scalar) in [r.read_mpint()?, r.read_mpint()?].into_iter().enumerate() {
            if scalar.len() > 32 {
                return Err(StrandError::Security("P-256 scalar too long".to_string()));
            }
            let end = 32 * (i + 1);
            raw[end - scalar.len()..end].copy_from_slice(scalar);
        }

        let sig = p256::ecdsa::Signature::from_slice(&raw)
            .map_err(|e| StrandError::Security(format!("Invalid P-256 signature: {}", e)))?;

        Ok(verifying_key.verify(data, &sig).is_ok())
    }
}

impl HostKey for EcdsaP256HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::EcdsaSha2Nistp256
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "ecdsa-sha2-nistp256");
        write_string(&mut buf, "nistp256");
        let point = self.verifying_key.to_encoded_point(false);
        write_bytes(&mut buf, point.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> StrandResult<Vec<u8>> {
        use signature::Signer;

        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let bytes = signature.to_bytes();

        let mut inner = encode_mpint(&bytes[..32]);
        inner.extend_from_slice(&encode_mpint(&bytes[32..]));
        Ok(signature_blob("ecdsa-sha2-nistp256", &inner))
    }
}

impl std::fmt::Debug for EcdsaP256HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaP256HostKey")
            .field("algorithm", &"ecdsa-sha2-nistp256")
            .field("curve", &"P-256")
            .finish_non_exhaustive()
    }
}

/// Reads the algorithm name from a public key blob.
pub fn key_algorithm(key_blob: &[u8]) -> StrandResult<String> {
    WireReader::new(key_blob).read_string()
}

/// Verifies an SSH signature blob over `data` with a public key blob.
///
/// Returns `Ok(false)` when the signature does not match and an error when
/// either blob is malformed or uses an unsupported algorithm.
pub fn verify_signature(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> StrandResult<bool> {
    let mut key = WireReader::new(key_blob);
    let key_alg = key.read_string()?;

    let mut sig = WireReader::new(signature_blob);
    let sig_alg = sig.read_string()?;
    let sig_bytes = sig.read_bytes()?;

    if key_alg != sig_alg {
        return Err(StrandError::Security(format!(
            "Signature algorithm {} does not match host key algorithm {}",
            sig_alg, key_alg
        )));
    }

    match HostKeyAlgorithm::from_name(&key_alg) {
        Some(HostKeyAlgorithm::SshEd25519) => {
            let public_key = key.read_bytes()?;
            Ed25519HostKey::verify(public_key, data, sig_bytes)
        }
        Some(HostKeyAlgorithm::EcdsaSha2Nistp256) => {
            let curve = key.read_string()?;
            if curve != "nistp256" {
                return Err(StrandError::Security(format!(
                    "Unexpected curve {} for ecdsa-sha2-nistp256",
                    curve
                )));
            }
            let point = key.read_bytes()?;
            EcdsaP256HostKey::verify(point, data, sig_bytes)
        }
        None => Err(StrandError::Security(format!(
            "Unsupported host key algorithm: {}",
            key_alg
        ))),
    }
}

/// OpenSSH-style SHA256 fingerprint of a public key blob.
///
/// # Example
///
/// ```rust
/// use strand_proto::ssh::hostkey::fingerprint;
///
/// assert!(fingerprint(b"key").starts_with("SHA256:"));
/// ```
pub fn fingerprint(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Label under which a host's keys are recorded: `host` on port 22,
/// `[host]:port` otherwise.
pub fn host_label(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Policy deciding whether a server host key is trusted.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns true if `key_blob` is acceptable for the host `label`.
    fn verify_host(&self, label: &str, key_blob: &[u8]) -> bool;
}

/// Accepts every host key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify_host(&self, _label: &str, _key_blob: &[u8]) -> bool {
        true
    }
}

/// Rejects every host key.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllHostKeys;

impl HostKeyVerifier for RejectAllHostKeys {
    fn verify_host(&self, _label: &str, _key_blob: &[u8]) -> bool {
        false
    }
}

/// Accepts host keys whose fingerprint is recorded for the host label.
#[derive(Debug, Default)]
pub struct FingerprintVerifier {
    known: RwLock<HashMap<String, Vec<String>>>,
}

impl FingerprintVerifier {
    /// Creates an empty verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fingerprint (`SHA256:...`) for a host label.
    pub fn add_fingerprint(&self, label: impl Into<String>, fingerprint: impl Into<String>) {
        self.known
            .write()
            .entry(label.into())
            .or_default()
            .push(fingerprint.into());
    }

    /// Records a public key blob for a host label.
    pub fn add_key(&self, label: impl Into<String>, key_blob: &[u8]) {
        self.add_fingerprint(label, fingerprint(key_blob));
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify_host(&self, label: &str, key_blob: &[u8]) -> bool {
        let fp = fingerprint(key_blob);
        self.known
            .read()
            .get(label)
            .map_or(false, |prints| prints.iter().any(|p| *p == fp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("ecdsa-sha2-nistp256"),
            Some(HostKeyAlgorithm::EcdsaSha2Nistp256)
        );
        assert_eq!(HostKeyAlgorithm::from_name("ssh-rsa"), None);
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_bytes();
        let sig = key.sign(b"hash").unwrap();

        assert_eq!(key_algorithm(&blob).unwrap(), "ssh-ed25519");
        assert!(verify_signature(&blob, b"hash", &sig).unwrap());
        assert!(!verify_signature(&blob, b"other", &sig).unwrap());
    }

    #[test]
    fn test_ed25519_from_bytes() {
        let key = Ed25519HostKey::generate().unwrap();
        let copy = Ed25519HostKey::from_bytes(&key.secret_bytes()[..]).unwrap();
        assert_eq!(key.public_key_bytes(), copy.public_key_bytes());
        assert!(Ed25519HostKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        let key = EcdsaP256HostKey::generate().unwrap();
        let blob = key.public_key_bytes();
        let sig = key.sign(b"hash").unwrap();

        assert_eq!(key_algorithm(&blob).unwrap(), "ecdsa-sha2-nistp256");
        assert!(verify_signature(&blob, b"hash", &sig).unwrap());
        assert!(!verify_signature(&blob, b"tampered", &sig).unwrap());
    }

    #[test]
    fn test_signature_algorithm_mismatch() {
        let ed = Ed25519HostKey::generate().unwrap();
        let ec = EcdsaP256HostKey::generate().unwrap();
        let sig = ec.sign(b"hash").unwrap();
        assert!(matches!(
            verify_signature(&ed.public_key_bytes(), b"hash", &sig),
            Err(StrandError::Security(_))
        ));
    }

    #[test]
    fn test_host_label() {
        assert_eq!(host_label("example.com", 22), "example.com");
        assert_eq!(host_label("127.0.0.1", 2222), "[127.0.0.1]:2222");
    }

    #[test]
    fn test_fingerprint_verifier() {
        let key = Ed25519HostKey::generate().unwrap();
        let other = Ed25519HostKey::generate().unwrap();
        let verifier = FingerprintVerifier::new();
        verifier.add_key("[localhost]:2222", &key.public_key_bytes());

        assert!(verifier.verify_host("[localhost]:2222", &key.public_key_bytes()));
        assert!(!verifier.verify_host("[localhost]:2222", &other.public_key_bytes()));
        assert!(!verifier.verify_host("localhost", &key.public_key_bytes()));
        assert!(AcceptAnyHostKey.verify_host("any", b"key"));
        assert!(!RejectAllHostKeys.verify_host("any", b"key"));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }
}
