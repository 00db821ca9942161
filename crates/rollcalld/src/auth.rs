use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("password required")]
    Missing,
    #[error("no admin password configured")]
    NotConfigured,
    #[error("incorrect password")]
    Mismatch,
}

/// Guards destructive and bulk-read operations behind an admin password.
///
/// Only the SHA-256 digest of the password is kept.
#[derive(Debug, Clone, Default)]
pub struct PasswordGate {
    digest: Option<[u8; 32]>,
}

impl PasswordGate {
    /// Build from a hex digest. Invalid hex leaves the gate unconfigured,
    /// which rejects every attempt.
    pub fn from_hex(digest_hex: Option<&str>) -> Self {
        let digest = digest_hex.and_then(|h| {
            let mut digest = [0u8; 32];
            match hex::decode_to_slice(h.trim(), &mut digest) {
                Ok(()) => Some(digest),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "admin_password_sha256 is not a SHA-256 hex digest; \
                         gated operations disabled"
                    );
                    None
                }
            }
        });
        Self { digest }
    }

    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    pub fn verify(&self, password: &str) -> Result<(), AuthError> {
        if password.is_empty() {
            return Err(AuthError::Missing);
        }
        let expected = self.digest.as_ref().ok_or(AuthError::NotConfigured)?;
        let actual: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if actual == *expected {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn hash_password(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }

    #[test]
    fn test_hash_is_known_digest() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_matching_password() {
        let digest = hash_password("s3cret");
        let gate = PasswordGate::from_hex(Some(&digest));
        assert!(gate.is_configured());
        assert_eq!(gate.verify("s3cret"), Ok(()));
        assert_eq!(gate.verify("S3cret"), Err(AuthError::Mismatch));
        assert_eq!(gate.verify(""), Err(AuthError::Missing));
    }

    #[test]
    fn test_uppercase_hex_is_accepted() {
        let digest = hash_password("s3cret").to_uppercase();
        assert_eq!(PasswordGate::from_hex(Some(&digest)).verify("s3cret"), Ok(()));
    }

    #[test]
    fn test_unconfigured_gate_rejects() {
        let gate = PasswordGate::from_hex(None);
        assert_eq!(gate.verify("anything"), Err(AuthError::NotConfigured));

        let bad = PasswordGate::from_hex(Some("not-hex"));
        assert!(!bad.is_configured());
        assert_eq!(bad.verify("anything"), Err(AuthError::NotConfigured));

        // valid hex, wrong length for a SHA-256 digest
        let short = PasswordGate::from_hex(Some("abcd"));
        assert!(!short.is_configured());
    }
}
