//! # Protocol Version Records
//!
//! Every envelope carries a signed [`AppProtocolVersion`] describing the
//! sender's application protocol. The [`VersionGate`] decides whether a
//! remote record is acceptable: either it is byte-equal to the local one,
//! or its signature verifies against a key in the trusted-signer set.
//!
//! Cross-version encounters are never an error at this layer; the router
//! and dealer surface them as a first-class event and drop (or fail) the
//! message.

use std::collections::HashSet;

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::identity::Keypair;

/// Domain separation prefix for version record signatures.
const VERSION_SIGNATURE_DOMAIN: &[u8] = b"lattica-version-v1:";

/// A signed protocol version descriptor.
///
/// `extra` is opaque to the transport; applications use it to carry
/// fork identifiers, feature bits, or network names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProtocolVersion {
    pub version: u32,
    pub extra: Vec<u8>,
    pub signature: Vec<u8>,
    pub signer: [u8; 32],
}

impl AppProtocolVersion {
    /// Create a version record signed by `keypair`.
    pub fn signed(version: u32, extra: Vec<u8>, keypair: &Keypair) -> Self {
        let payload = Self::signed_payload(version, &extra);
        let mut prefixed = Vec::with_capacity(VERSION_SIGNATURE_DOMAIN.len() + payload.len());
        prefixed.extend_from_slice(VERSION_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(&payload);
        let signature = keypair.sign(&prefixed).to_bytes().to_vec();
        Self {
            version,
            extra,
            signature,
            signer: keypair.public_key_bytes(),
        }
    }

    fn signed_payload(version: u32, extra: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + extra.len());
        payload.extend_from_slice(&version.to_be_bytes());
        payload.extend_from_slice(extra);
        payload
    }

    /// Verify the record's signature against its declared signer.
    pub fn verify(&self) -> bool {
        if self.signature.len() != 64 {
            return false;
        }
        let verifying_key = match ed25519_dalek::VerifyingKey::try_from(self.signer.as_slice()) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig_bytes: [u8; 64] = match self.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let signature = Signature::from_bytes(&sig_bytes);

        let payload = Self::signed_payload(self.version, &self.extra);
        let mut prefixed = Vec::with_capacity(VERSION_SIGNATURE_DOMAIN.len() + payload.len());
        prefixed.extend_from_slice(VERSION_SIGNATURE_DOMAIN);
        prefixed.extend_from_slice(&payload);

        verifying_key.verify_strict(&prefixed, &signature).is_ok()
    }
}

/// Compatibility gate between the local version and remote records.
#[derive(Debug)]
pub struct VersionGate {
    local: AppProtocolVersion,
    trusted_signers: HashSet<[u8; 32]>,
}

impl VersionGate {
    pub fn new(local: AppProtocolVersion, trusted_signers: HashSet<[u8; 32]>) -> Self {
        Self {
            local,
            trusted_signers,
        }
    }

    pub fn local(&self) -> &AppProtocolVersion {
        &self.local
    }

    /// A remote version is compatible iff it is byte-equal to the local
    /// record, or it carries a valid signature from a trusted signer.
    pub fn compatible(&self, remote: &AppProtocolVersion) -> bool {
        if remote == &self.local {
            return true;
        }
        self.trusted_signers.contains(&remote.signer) && remote.verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_record_verifies() {
        let keypair = Keypair::generate();
        let record = AppProtocolVersion::signed(3, b"mainnet".to_vec(), &keypair);
        assert!(record.verify());
    }

    #[test]
    fn tampered_record_fails_verification() {
        let keypair = Keypair::generate();
        let mut record = AppProtocolVersion::signed(3, b"mainnet".to_vec(), &keypair);
        record.version = 4;
        assert!(!record.verify());
    }

    #[test]
    fn equal_versions_are_compatible() {
        let keypair = Keypair::generate();
        let local = AppProtocolVersion::signed(1, Vec::new(), &keypair);
        let gate = VersionGate::new(local.clone(), HashSet::new());
        assert!(gate.compatible(&local));
    }

    #[test]
    fn unequal_untrusted_version_rejected() {
        let ours = Keypair::generate();
        let theirs = Keypair::generate();
        let gate = VersionGate::new(
            AppProtocolVersion::signed(1, Vec::new(), &ours),
            HashSet::new(),
        );
        let remote = AppProtocolVersion::signed(2, Vec::new(), &theirs);
        assert!(!gate.compatible(&remote));
    }

    #[test]
    fn trusted_signer_version_accepted() {
        let ours = Keypair::generate();
        let signer = Keypair::generate();
        let mut trusted = HashSet::new();
        trusted.insert(signer.public_key_bytes());
        let gate = VersionGate::new(AppProtocolVersion::signed(1, Vec::new(), &ours), trusted);

        let remote = AppProtocolVersion::signed(2, Vec::new(), &signer);
        assert!(gate.compatible(&remote));

        // A forged record claiming the trusted signer still fails.
        let mut forged = remote.clone();
        forged.extra = b"forged".to_vec();
        assert!(!gate.compatible(&forged));
    }
}
