//! Password checking.
//!
//! Passwords are never held in clear text after startup. Each one is
//! replaced by an HMAC-SHA256 digest keyed with a random per-process key,
//! and login attempts are checked with a constant-time comparison.

use crate::config::UserEntry;
use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Validates logins against the configured users.
#[derive(Clone)]
pub struct CredentialValidator {
    key: [u8; 16],
    digests: HashMap<String, Vec<u8>>,
}

impl CredentialValidator {
    /// Creates a validator for the given users.
    pub fn new(users: &[UserEntry]) -> ServerResult<Self> {
        let key = Uuid::new_v4().into_bytes();
        let mut digests = HashMap::with_capacity(users.len());
        for entry in users {
            let digest = keyed(&key)?
                .chain_update(entry.password.as_bytes())
                .finalize()
                .into_bytes()
                .to_vec();
            digests.insert(entry.user.clone(), digest);
        }
        Ok(Self { key, digests })
    }

    /// Returns true if any user is configured.
    pub fn is_enabled(&self) -> bool {
        !self.digests.is_empty()
    }

    /// Checks a login.
    pub fn verify(&self, user: &str, password: &str) -> ServerResult<()> {
        let mut mac = keyed(&self.key)?;
        mac.update(password.as_bytes());

        match self.digests.get(user) {
            Some(digest) => mac
                .verify_slice(digest)
                .map_err(|_| ServerError::Unauthorized(format!("login rejected for {user}"))),
            None => Err(ServerError::Unauthorized(format!("login rejected for {user}"))),
        }
    }
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("users", &self.digests.len())
            .finish_non_exhaustive()
    }
}

fn keyed(key: &[u8]) -> ServerResult<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| ServerError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<UserEntry> {
        vec![UserEntry {
            user: "ftpuser".into(),
            password: "ftppass".into(),
        }]
    }

    #[test]
    fn accepts_configured_login() {
        let validator = CredentialValidator::new(&users()).unwrap();
        assert!(validator.is_enabled());
        assert!(validator.verify("ftpuser", "ftppass").is_ok());
    }

    #[test]
    fn rejects_wrong_password() {
        let validator = CredentialValidator::new(&users()).unwrap();
        assert!(matches!(
            validator.verify("ftpuser", "ftppas"),
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[test]
    fn rejects_unknown_user() {
        let validator = CredentialValidator::new(&users()).unwrap();
        assert!(validator.verify("root", "ftppass").is_err());
    }

    #[test]
    fn digests_differ_between_processes() {
        let a = CredentialValidator::new(&users()).unwrap();
        let b = CredentialValidator::new(&users()).unwrap();
        assert_ne!(a.digests["ftpuser"], b.digests["ftpuser"]);
    }

    #[test]
    fn empty_validator_is_disabled() {
        let validator = CredentialValidator::new(&[]).unwrap();
        assert!(!validator.is_enabled());
    }
}
