//! Authentication plugins.
//!
//! Closed set of the plugins MySQL servers actually negotiate. Each plugin
//! exposes two pure operations: `fast_phase` computes the scrambled first
//! response from the password and server salt, `full_phase` produces the
//! fallback payload used when hashing is insufficient (TLS cleartext or
//! RSA-encrypted). Empty passwords always produce empty responses.
//!
//! Scramble algorithms:
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(salt + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + salt)`

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use myflux_core::{ConnectionErrorKind, Error, Result};

/// Status bytes inside AuthMoreData for the sha2 plugin family.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Cached credentials matched; OK follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full authentication required
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// The authentication plugins this driver can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// `mysql_native_password` (SHA1, MySQL < 8.0 default)
    Native,
    /// `caching_sha2_password` (SHA256, MySQL 8.0+ default)
    CachingSha2,
    /// `sha256_password` (RSA or TLS only)
    Sha256,
    /// `mysql_clear_password` (TLS only)
    Clear,
}

impl AuthPlugin {
    /// Resolve a plugin from its wire name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" => Ok(AuthPlugin::Native),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2),
            "sha256_password" => Ok(AuthPlugin::Sha256),
            "mysql_clear_password" => Ok(AuthPlugin::Clear),
            other => Err(Error::connection(
                ConnectionErrorKind::Authentication,
                format!("unsupported authentication plugin '{}'", other),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::Native => "mysql_native_password",
            AuthPlugin::CachingSha2 => "caching_sha2_password",
            AuthPlugin::Sha256 => "sha256_password",
            AuthPlugin::Clear => "mysql_clear_password",
        }
    }

    /// Whether the plugin may only run over an encrypted channel (unless an
    /// RSA key handoff is available).
    pub fn ssl_required(self) -> bool {
        matches!(self, AuthPlugin::Sha256 | AuthPlugin::Clear)
    }

    /// First authentication attempt from hashed credentials.
    pub fn fast_phase(self, password: &str, salt: &[u8]) -> Vec<u8> {
        if password.is_empty() {
            return Vec::new();
        }
        match self {
            AuthPlugin::Native => native_scramble(password, salt),
            AuthPlugin::CachingSha2 => sha2_scramble(password, salt),
            // Ask for the public key; full_phase carries the password.
            AuthPlugin::Sha256 => vec![0x01],
            AuthPlugin::Clear => cleartext(password),
        }
    }

    /// Fallback payload over a secure channel. `None` when the plugin has
    /// no full phase.
    pub fn full_phase(self, password: &str) -> Option<Vec<u8>> {
        match self {
            AuthPlugin::Native => None,
            AuthPlugin::CachingSha2 | AuthPlugin::Sha256 | AuthPlugin::Clear => {
                Some(cleartext(password))
            }
        }
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`, 20 bytes.
fn native_scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    let salt = if salt.len() > 20 { &salt[..20] } else { salt };

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)`, 32 bytes.
fn sha2_scramble(password: &str, salt: &[u8]) -> Vec<u8> {
    // Servers send the 20-byte scramble with a trailing NUL.
    let salt = if salt.len() == 21 && salt.last() == Some(&0) {
        &salt[..20]
    } else {
        salt
    };

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(hash);
    let hash2: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(salt);
    let scramble: [u8; 32] = hasher.finalize().into();

    hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// Password with NUL terminator, for cleartext transmission over TLS.
fn cleartext(password: &str) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    out
}

/// RSA-encrypt the NUL-terminated password XOR-folded with the salt, for
/// the sha2 plugin family without TLS.
///
/// MySQL 8.0.5+ uses OAEP padding for `caching_sha2_password`; older
/// `sha256_password` exchanges use PKCS#1 v1.5.
pub fn rsa_encrypt_password(
    password: &str,
    salt: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    if salt.is_empty() {
        return Err(auth_error("server salt is empty"));
    }

    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= salt[i % salt.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not valid PEM: {}", e)))?;

    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("cannot parse server RSA public key: {}", e)))?;

    let encrypted = if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &plain)
    }
    .map_err(|e| auth_error(format!("RSA encryption failed: {}", e)))?;

    Ok(encrypted)
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}
