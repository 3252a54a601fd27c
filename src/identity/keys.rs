// Cryptographic key management for node identity.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroize;

use crate::error::TransportError;

/// 20-byte Kademlia routing key derived from a public key.
pub type Address = [u8; 20];

/// A node's signing key pair. Holds the private half; never serialized
/// wholesale, never logged.
#[derive(Clone)]
pub struct IdentityKeys {
    signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::Unexpected("invalid private key length".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&array),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

/// A public key and its derived routing address. Equality and hashing use
/// the raw public key bytes (spec.md §3).
#[derive(Clone, Copy, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
}

impl PeerIdentity {
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self { verifying_key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidMessage("malformed public key".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&array)
            .map_err(|e| TransportError::InvalidMessage(format!("bad public key: {e}")))?;
        Ok(Self { verifying_key })
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// 20-byte routing key: the first 20 bytes of `blake3(public_key)`.
    pub fn address(&self) -> Address {
        let hash = blake3::hash(&self.as_bytes());
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash.as_bytes()[..20]);
        address
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        self.verifying_key.verify(data, &signature).is_ok()
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::hash::Hash for PeerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", hex::encode(self.address()))
    }
}
