//! Peer descriptors and the signed protocol-version record carried on every
//! envelope (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::identity::{Address, PeerIdentity};

/// A signed application-protocol version. Two peers are compatible iff
/// their versions are byte-equal, or an application-supplied predicate
/// using the trusted-signer set accepts the remote's version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppProtocolVersion {
    pub version: u32,
    pub extra: Vec<u8>,
    pub signature: Vec<u8>,
    pub signer: Vec<u8>,
}

impl AppProtocolVersion {
    pub fn new(version: u32, extra: Vec<u8>, signature: Vec<u8>, signer: Vec<u8>) -> Self {
        Self {
            version,
            extra,
            signature,
            signer,
        }
    }

    fn byte_equal(&self, other: &Self) -> bool {
        self.version == other.version && self.extra == other.extra
    }

    /// The bytes `signature` is expected to cover: `version` (big-endian)
    /// followed by `extra`.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = self.version.to_be_bytes().to_vec();
        buf.extend_from_slice(&self.extra);
        buf
    }

    /// Verifies that `signature` is a valid signature by `signer` over this
    /// version's `(version, extra)` pair.
    pub fn verify_signature(&self) -> bool {
        let Ok(signer) = PeerIdentity::from_bytes(&self.signer) else {
            return false;
        };
        signer.verify(&self.signed_bytes(), &self.signature)
    }

    /// Compatibility gate used for every non-PING inbound message
    /// (spec.md §3, §7 property 7).
    ///
    /// `accept_foreign` is the application-supplied predicate invoked only
    /// when versions differ; it receives the remote version and the set of
    /// trusted signers. With an empty trusted-signer set and differing
    /// versions, this always returns `false` — property 7.
    pub fn compatible(
        &self,
        remote: &Self,
        trusted_signers: &[Vec<u8>],
        accept_foreign: impl FnOnce(&Self, &[Vec<u8>]) -> bool,
    ) -> bool {
        self.byte_equal(remote) || accept_foreign(remote, trusted_signers)
    }
}

/// The default `accept_foreign` predicate (spec.md §3): a remote version
/// that differs from the local one is still accepted iff its signature
/// verifies against its own claimed signer, and that signer is in the
/// caller-configured trusted set.
pub fn signer_is_trusted(remote: &AppProtocolVersion, trusted_signers: &[Vec<u8>]) -> bool {
    remote.verify_signature() && trusted_signers.iter().any(|signer| signer.as_slice() == remote.signer.as_slice())
}

/// An unbound peer: identity, claimed application version, and an optional
/// publicly reachable IP the peer believes it has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub identity_bytes: Vec<u8>,
    pub app_version: AppProtocolVersion,
    pub public_ip: Option<std::net::IpAddr>,
}

impl Peer {
    pub fn new(identity: PeerIdentity, app_version: AppProtocolVersion) -> Self {
        Self {
            identity_bytes: identity.as_bytes().to_vec(),
            app_version,
            public_ip: None,
        }
    }

    pub fn with_public_ip(mut self, ip: std::net::IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    pub fn identity(&self) -> Result<PeerIdentity, crate::error::TransportError> {
        PeerIdentity::from_bytes(&self.identity_bytes)
    }

    pub fn address(&self) -> Result<Address, crate::error::TransportError> {
        Ok(self.identity()?.address())
    }
}

/// A peer with a network endpoint — the only form the transport can
/// actually address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundPeer {
    pub peer: Peer,
    pub host: String,
    pub port: u16,
}

impl BoundPeer {
    pub fn new(peer: Peer, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> Result<Address, crate::error::TransportError> {
        self.peer.address()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for BoundPeer {
    fn eq(&self, other: &Self) -> bool {
        self.peer.identity_bytes == other.peer.identity_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    fn version(v: u32) -> AppProtocolVersion {
        AppProtocolVersion::new(v, vec![], vec![], vec![])
    }

    #[test]
    fn byte_equal_versions_are_compatible_without_predicate() {
        let a = version(1);
        let b = version(1);
        assert!(a.compatible(&b, &[], |_, _| panic!("predicate should not run")));
    }

    #[test]
    fn differing_versions_with_no_trusted_signers_are_incompatible() {
        let a = version(1);
        let b = version(2);
        assert!(!a.compatible(&b, &[], |_, trusted| !trusted.is_empty()));
    }

    #[test]
    fn signer_is_trusted_accepts_a_properly_signed_version_from_a_trusted_signer() {
        let signer_keys = IdentityKeys::generate();
        let signer_bytes = signer_keys.identity().as_bytes().to_vec();

        let mut remote = AppProtocolVersion::new(2, vec![9, 9], vec![], signer_bytes.clone());
        remote.signature = signer_keys.sign(&remote.signed_bytes());

        assert!(signer_is_trusted(&remote, &[signer_bytes.clone()]));
        assert!(!signer_is_trusted(&remote, &[vec![0u8; 32]]));
    }

    #[test]
    fn signer_is_trusted_rejects_an_invalid_signature_even_from_a_trusted_signer() {
        let signer_keys = IdentityKeys::generate();
        let signer_bytes = signer_keys.identity().as_bytes().to_vec();

        let remote = AppProtocolVersion::new(2, vec![], vec![0u8; 64], signer_bytes.clone());
        assert!(!signer_is_trusted(&remote, &[signer_bytes]));
    }

    #[test]
    fn bound_peer_endpoint_formats_host_port() {
        let keys = IdentityKeys::generate();
        let peer = Peer::new(keys.identity(), version(1));
        let bound = BoundPeer::new(peer, "127.0.0.1", 4000);
        assert_eq!(bound.endpoint(), "127.0.0.1:4000");
    }
}
