//! Long-lived secp256k1 signing key, persisted under an exclusive file lock.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use attestgate_core::error::CryptoError;
use base64::Engine as _;
use fs2::FileExt;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Holds the service's secp256k1 signing key in memory after boot.
pub struct Keystore {
    signing_key: SigningKey,
}

impl Keystore {
    /// Load the key at `key_path`, generating and persisting a fresh one if
    /// the file doesn't exist or is empty. Acquires an exclusive lock on a
    /// `.lock` sibling file for the duration of the load-or-generate step so
    /// two boot attempts never race to create two different keys.
    pub fn load_or_generate(key_path: &Path) -> Result<Self, CryptoError> {
        let lock_path = key_path.with_extension("lock");
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&lock_path)
            .map_err(CryptoError::Io)?;
        lock_file
            .lock_exclusive()
            .map_err(|e| CryptoError::LockFailed(e.to_string()))?;

        let result = Self::load_or_generate_locked(key_path);

        let _ = lock_file.unlock();
        result
    }

    fn load_or_generate_locked(key_path: &Path) -> Result<Self, CryptoError> {
        match OpenOptions::new().read(true).open(key_path) {
            Ok(mut file) => {
                let mut hex = String::new();
                file.read_to_string(&mut hex)?;
                let hex = hex.trim();
                if hex.is_empty() {
                    return Err(CryptoError::CorruptKey(format!(
                        "key file {} exists but is empty",
                        key_path.display()
                    )));
                }
                let bytes = hex_decode(hex).map_err(|e| {
                    CryptoError::CorruptKey(format!("key file is not valid hex: {e}"))
                })?;
                let signing_key = SigningKey::from_slice(&bytes)
                    .map_err(|e| CryptoError::CorruptKey(format!("invalid key bytes: {e}")))?;
                Ok(Self { signing_key })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let signing_key = SigningKey::random(&mut OsRng);
                let hex = hex_encode(signing_key.to_bytes().as_slice());
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(key_path)?;
                file.write_all(hex.as_bytes())?;
                file.sync_all()?;
                tracing::info!(path = %key_path.display(), "generated new signing key");
                Ok(Self { signing_key })
            }
            Err(e) => Err(CryptoError::Io(e)),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// Base64-encoded SEC1 compressed public key, suitable for the
    /// `verifying_key` field of attestation reports.
    pub fn public_key_base64(&self) -> String {
        B64.encode(self.verifying_key().to_sec1_bytes())
    }

    /// Sign arbitrary bytes, returning a base64-encoded DER signature.
    pub fn sign(&self, bytes: &[u8]) -> Result<String, CryptoError> {
        let signature: Signature = self
            .signing_key
            .try_sign(bytes)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(B64.encode(signature.to_der().as_bytes()))
    }

    pub fn verify(
        public_key_b64: &str,
        bytes: &[u8],
        signature_b64: &str,
    ) -> Result<bool, CryptoError> {
        let pub_bytes = B64
            .decode(public_key_b64)
            .map_err(|e| CryptoError::CorruptKey(e.to_string()))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(&pub_bytes)
            .map_err(|e| CryptoError::CorruptKey(e.to_string()))?;
        let sig_bytes = B64
            .decode(signature_b64)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let signature = match Signature::from_der(&sig_bytes) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        Ok(verifying_key.verify(bytes, &signature).is_ok())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Default on-disk location for the signing key, overridable in tests.
pub fn default_key_path() -> PathBuf {
    std::env::var("ATTESTGATE_KEY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("attestgate_signing_key.hex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");

        let ks1 = Keystore::load_or_generate(&path).unwrap();
        let pub1 = ks1.public_key_base64();

        let ks2 = Keystore::load_or_generate(&path).unwrap();
        let pub2 = ks2.public_key_base64();

        assert_eq!(pub1, pub2);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");
        let ks = Keystore::load_or_generate(&path).unwrap();

        let message = b"canonical response body";
        let sig = ks.sign(message).unwrap();

        assert!(Keystore::verify(&ks.public_key_base64(), message, &sig).unwrap());
        assert!(!Keystore::verify(&ks.public_key_base64(), b"tampered", &sig).unwrap());
    }

    #[test]
    fn empty_key_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");
        std::fs::write(&path, "").unwrap();

        let result = Keystore::load_or_generate(&path);
        assert!(matches!(result, Err(CryptoError::CorruptKey(_))));
    }
}
