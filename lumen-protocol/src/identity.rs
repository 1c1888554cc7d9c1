//! Host identity: keypair, certificate, and admin credentials.
//!
//! The identity is created on first run and then never mutated at runtime,
//! with one exception: the admin password flow rewrites the credentials
//! file atomically (and the control plane invalidates session cookies).

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Paths;
use crate::crypto;
use crate::error::Result;

/// Common name on the generated host certificate.
const HOST_CERT_CN: &str = "Lumen Gamestream Host";

/// RSA key size for generated credentials.
const HOST_KEY_BITS: u32 = 2048;

/// Admin credentials as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    /// `hex(sha256(password ‖ salt))`
    pub password_hash: String,
    /// Lowercase hex, 16 bytes.
    pub salt: String,
}

impl Credentials {
    /// Build fresh credentials with a new random salt.
    pub fn create(username: &str, password: &str) -> Result<Self> {
        let salt = crypto::hex_string(&crypto::random_bytes(16)?);
        let password_hash = hash_password(password, &salt);
        Ok(Self {
            username: username.to_string(),
            password_hash,
            salt,
        })
    }

    /// Check a login attempt. Usernames compare case-insensitively.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.username.eq_ignore_ascii_case(username)
            && hash_password(password, &self.salt) == self.password_hash
    }
}

/// `hex(sha256(password ‖ salt))` with the salt as its hex string, matching
/// the wire-side hashing the clients perform.
pub fn hash_password(password: &str, salt: &str) -> String {
    crypto::hex_string(&crypto::sha256(format!("{password}{salt}").as_bytes()))
}

/// Process-wide host identity.
pub struct HostIdentity {
    /// UUID string identifying this host to clients.
    pub unique_id: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Salt used when no credentials file exists yet. Regenerated each
    /// start, so cookies and OTPs never outlive an unconfigured host.
    ephemeral_salt: String,
    creds: Mutex<Option<Credentials>>,
}

impl HostIdentity {
    /// Load the host certificate and credentials, generating any missing
    /// pieces. `unique_id` comes from the state file (see the client
    /// registry, which owns it).
    pub fn load_or_create(paths: &Paths, unique_id: String) -> Result<Self> {
        let (cert_pem, key_pem) = if paths.cert.exists() && paths.key.exists() {
            (
                fs::read_to_string(&paths.cert)?,
                fs::read_to_string(&paths.key)?,
            )
        } else {
            info!("generating host certificate ({HOST_KEY_BITS}-bit RSA)");
            let creds = crypto::gen_creds(HOST_CERT_CN, HOST_KEY_BITS)?;
            crate::storage::write_atomic(&paths.cert, creds.cert_pem.as_bytes())?;
            crate::storage::write_atomic(&paths.key, creds.key_pem.as_bytes())?;
            (creds.cert_pem, creds.key_pem)
        };

        let creds = crate::storage::read_json::<Credentials>(&paths.credentials)?;
        if creds.is_some() {
            info!("loaded admin credentials");
        }

        Ok(Self {
            unique_id,
            cert_pem,
            key_pem,
            ephemeral_salt: crypto::hex_string(&crypto::random_bytes(16)?),
            creds: Mutex::new(creds),
        })
    }

    /// The salt used for cookie and OTP hashing.
    pub fn salt(&self) -> String {
        self.creds
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.salt.clone())
            .unwrap_or_else(|| self.ephemeral_salt.clone())
    }

    /// Whether an admin account has been configured.
    pub fn has_credentials(&self) -> bool {
        self.creds.lock().unwrap().is_some()
    }

    /// Validate an admin login.
    pub fn verify_login(&self, username: &str, password: &str) -> bool {
        self.creds
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.verify(username, password))
            .unwrap_or(false)
    }

    /// Validate the current credentials before a password change. An
    /// unconfigured host accepts any current credentials.
    pub fn verify_current_for_change(&self, username: &str, password: &str) -> bool {
        match self.creds.lock().unwrap().as_ref() {
            Some(c) => c.verify(username, password),
            None => true,
        }
    }

    /// Atomically replace the stored credentials.
    pub fn save_credentials(&self, path: &Path, username: &str, password: &str) -> Result<()> {
        let creds = Credentials::create(username, password)?;
        crate::storage::write_json_atomic(path, &creds)?;
        *self.creds.lock().unwrap() = Some(creds);
        info!("admin credentials updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths() -> (TempDir, Paths) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn generates_and_reloads_certificate() {
        let (_dir, paths) = paths();

        let first = HostIdentity::load_or_create(&paths, "uuid-1".into()).unwrap();
        assert!(first.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(paths.cert.exists() && paths.key.exists());

        // A second load must reuse the same certificate.
        let second = HostIdentity::load_or_create(&paths, "uuid-1".into()).unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
    }

    #[test]
    fn credentials_round_trip() {
        let (_dir, paths) = paths();
        let identity = HostIdentity::load_or_create(&paths, "uuid-1".into()).unwrap();

        assert!(!identity.has_credentials());
        assert!(!identity.verify_login("admin", "hunter2"));
        assert!(identity.verify_current_for_change("", ""));

        identity
            .save_credentials(&paths.credentials, "Admin", "hunter2")
            .unwrap();
        assert!(identity.has_credentials());
        assert!(identity.verify_login("admin", "hunter2"));
        assert!(identity.verify_login("ADMIN", "hunter2"));
        assert!(!identity.verify_login("admin", "wrong"));

        // Reload picks the stored credentials and their salt up again.
        let reloaded = HostIdentity::load_or_create(&paths, "uuid-1".into()).unwrap();
        assert!(reloaded.verify_login("admin", "hunter2"));
        assert_eq!(reloaded.salt(), identity.salt());
    }

    #[test]
    fn ephemeral_salt_without_credentials() {
        let (_dir, paths) = paths();
        let identity = HostIdentity::load_or_create(&paths, "uuid-1".into()).unwrap();
        let salt = identity.salt();
        assert_eq!(salt.len(), 32);
        assert_eq!(identity.salt(), salt);
    }
}
