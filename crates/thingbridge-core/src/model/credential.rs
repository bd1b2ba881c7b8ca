// ── Device credentials ──

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

/// Raw key length before base64 encoding.
pub const KEY_LENGTH: usize = 32;

/// A device's primary symmetric key (base64).
///
/// `Debug` never prints the key.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn secret(&self) -> &SecretString {
        &self.0
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl From<SecretString> for Credential {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

/// A freshly generated primary/secondary key pair.
///
/// Both keys are registered with the hub; only the primary is kept.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub primary: Credential,
    pub secondary: Credential,
}

impl KeyPair {
    /// Generate two independent keys from the OS random source.
    pub fn generate() -> Self {
        Self {
            primary: random_key(),
            secondary: random_key(),
        }
    }

    pub fn into_primary(self) -> Credential {
        self.primary
    }
}

fn random_key() -> Credential {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    Credential::new(STANDARD.encode(bytes))
}
