//! Host key trust policy
//!
//! The default policy accepts every host key the server presents. That is
//! NOT verified trust: it only keeps tunnels working against servers whose
//! keys are not known in advance. Use [`HostKeyPolicy::Pinned`] wherever the
//! server's key can be distributed ahead of time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::Md5;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::error::TunnelError;

/// How the server's host key is validated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any presented key without verification
    #[default]
    AcceptAny,

    /// Accept only keys whose SHA-256 fingerprint is listed
    /// (`SHA256:<base64>`, as printed by `ssh-keygen -l`)
    Pinned { fingerprints: Vec<String> },
}

impl HostKeyPolicy {
    pub fn pinned<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Pinned {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }

    /// Decide on a host key given its wire-format public key blob
    pub fn check_key_bytes(
        &self,
        host: &str,
        port: u16,
        key_bytes: &[u8],
    ) -> Result<(), TunnelError> {
        let fingerprint = sha256_fingerprint(key_bytes);
        match self {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting unverified host key for {}:{} (fingerprint: {}, md5: {})",
                    host,
                    port,
                    fingerprint,
                    md5_fingerprint(key_bytes)
                );
                Ok(())
            }
            HostKeyPolicy::Pinned { fingerprints } => {
                let actual = normalize_fingerprint(&fingerprint);
                if fingerprints
                    .iter()
                    .any(|pinned| normalize_fingerprint(pinned) == actual)
                {
                    info!("Host key verified for {}:{} ({})", host, port, fingerprint);
                    Ok(())
                } else {
                    warn!(
                        "Host key for {}:{} does not match any pinned fingerprint (got {})",
                        host, port, fingerprint
                    );
                    Err(TunnelError::HostKeyRejected(format!(
                        "{}:{} presented {}, which is not pinned",
                        host, port, fingerprint
                    )))
                }
            }
        }
    }

    /// Decide on a host key presented during the handshake
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), TunnelError> {
        self.check_key_bytes(host, port, &key.public_key_bytes())
    }
}

/// OpenSSH-style SHA-256 fingerprint: `SHA256:<unpadded base64>`
pub fn sha256_fingerprint(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Legacy MD5 fingerprint: colon-separated lowercase hex
pub fn md5_fingerprint(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn normalize_fingerprint(fp: &str) -> &str {
    let fp = fp.trim();
    fp.strip_prefix("SHA256:").unwrap_or(fp).trim_end_matches('=')
}

#[cfg(test)]
mod tests {
    use super::*;

    // ssh-ed25519 public key blob of the fixture key in `keys.rs` tests
    const KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIO9Abd6z9FhxnJorlA1PnmyInyRM6H50/bHwOVKynRgz";

    fn key_bytes() -> Vec<u8> {
        BASE64.decode(KEY_B64).unwrap()
    }

    #[test]
    fn test_sha256_fingerprint_matches_ssh_keygen() {
        assert_eq!(
            sha256_fingerprint(&key_bytes()),
            "SHA256:REM+WhX37dMFIGbjp7vImI4mYZSlQguz8m1PPtGOmiA"
        );
    }

    #[test]
    fn test_md5_fingerprint_matches_ssh_keygen() {
        assert_eq!(
            md5_fingerprint(&key_bytes()),
            "24:f6:71:a2:f9:27:d5:05:b1:d3:05:da:b2:37:ca:b6"
        );
    }

    #[test]
    fn test_accept_any_accepts() {
        assert!(HostKeyPolicy::AcceptAny
            .check_key_bytes("example.com", 22, &key_bytes())
            .is_ok());
    }

    #[test]
    fn test_pinned_accepts_with_or_without_prefix() {
        let with_prefix =
            HostKeyPolicy::pinned(["SHA256:REM+WhX37dMFIGbjp7vImI4mYZSlQguz8m1PPtGOmiA"]);
        let bare = HostKeyPolicy::pinned(["REM+WhX37dMFIGbjp7vImI4mYZSlQguz8m1PPtGOmiA="]);
        assert!(with_prefix.check_key_bytes("h", 22, &key_bytes()).is_ok());
        assert!(bare.check_key_bytes("h", 22, &key_bytes()).is_ok());
    }

    #[test]
    fn test_pinned_rejects_unknown_key() {
        let policy = HostKeyPolicy::pinned(["SHA256:k1TET9DbOla3qVMnZQGWnMEGHpWVlEJ3TAr2mh8+11g"]);
        assert!(matches!(
            policy.check_key_bytes("h", 22, &key_bytes()),
            Err(TunnelError::HostKeyRejected(_))
        ));
    }

    #[test]
    fn test_policy_serde() {
        let policy: HostKeyPolicy =
            serde_json::from_str(r#"{"mode":"pinned","fingerprints":["SHA256:abc"]}"#).unwrap();
        assert_eq!(policy, HostKeyPolicy::pinned(["SHA256:abc"]));
        let json = serde_json::to_string(&HostKeyPolicy::AcceptAny).unwrap();
        assert_eq!(json, r#"{"mode":"accept_any"}"#);
    }
}
