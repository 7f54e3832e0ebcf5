//! Host key material used to impersonate the real server.
//!
//! A [`HostIdentity`] is immutable after construction. Each session may
//! generate its own, or the operator can load one key and reuse it so the
//! impersonated host fingerprint stays stable across sessions.

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, HashAlg, LineEnding};
use russh::keys::{decode_secret_key, PrivateKey};

use crate::error::IdentityError;

/// Smallest RSA modulus we will generate.
pub const MIN_RSA_BITS: usize = 2048;
/// Largest RSA modulus we will generate.
pub const MAX_RSA_BITS: usize = 8192;
/// Key strength used when the operator does not request one.
pub const DEFAULT_RSA_BITS: usize = 4096;

/// An asymmetric host key plus everything needed to present it during a
/// server-side handshake.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    key: PrivateKey,
}

impl HostIdentity {
    /// Generate a fresh RSA host key of the requested strength.
    ///
    /// The bit length is validated before any entropy is consumed.
    pub fn generate(bits: usize) -> Result<Self, IdentityError> {
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
            return Err(IdentityError::UnsupportedBits(bits));
        }
        let pair = RsaKeypair::random(&mut OsRng, bits).map_err(IdentityError::Generate)?;
        let key = PrivateKey::new(KeypairData::Rsa(pair), "").map_err(IdentityError::Generate)?;
        Ok(Self { key })
    }

    /// Generate a fresh Ed25519 host key.
    ///
    /// Cheaper than RSA generation; useful when the impersonated key type
    /// does not matter.
    pub fn generate_ed25519() -> Result<Self, IdentityError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(IdentityError::Generate)?;
        Ok(Self { key })
    }

    /// Parse an encoded private key (OpenSSH or PEM formats).
    ///
    /// Fails fast on malformed input, before any network activity.
    pub fn load(encoded: &str) -> Result<Self, IdentityError> {
        let key = decode_secret_key(encoded, None).map_err(IdentityError::Parse)?;
        Ok(Self { key })
    }

    pub fn from_key(key: PrivateKey) -> Self {
        Self { key }
    }

    /// The private key, cloned into a server configuration.
    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    /// SHA-256 fingerprint of the public half, for logging.
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// Serialize back to OpenSSH private-key text.
    pub fn to_openssh(&self) -> Result<String, IdentityError> {
        self.key
            .to_openssh(LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(IdentityError::Generate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undersized_rsa_key() {
        match HostIdentity::generate(1024) {
            Err(IdentityError::UnsupportedBits(1024)) => {}
            other => panic!("expected UnsupportedBits, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_oversized_rsa_key() {
        assert!(matches!(
            HostIdentity::generate(65536),
            Err(IdentityError::UnsupportedBits(65536))
        ));
    }

    #[test]
    fn load_rejects_garbage_input() {
        assert!(matches!(
            HostIdentity::load("this is not a private key"),
            Err(IdentityError::Parse(_))
        ));
    }

    #[test]
    fn openssh_round_trip_preserves_fingerprint() {
        let identity = HostIdentity::generate_ed25519().unwrap();
        let encoded = identity.to_openssh().unwrap();
        let reloaded = HostIdentity::load(&encoded).unwrap();
        assert_eq!(identity.fingerprint(), reloaded.fingerprint());
    }

    // RSA generation without optimizations takes long enough to annoy CI.
    #[test]
    #[ignore]
    fn generates_rsa_key_of_requested_strength() {
        let identity = HostIdentity::generate(2048).unwrap();
        assert!(identity.fingerprint().starts_with("SHA256:"));
    }
}
