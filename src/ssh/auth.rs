//! Credential Provider
//!
//! Turns the configured [`Credential`] into an authentication offer for the
//! methods the server says it still accepts. Exactly one credential form is
//! configured, so there is never more than one offer to make.

use std::fmt;

use russh::{MethodKind, MethodSet};
use tracing::debug;
use zeroize::Zeroizing;

use super::config::Credential;
use super::error::TunnelError;
use super::keys::SigningKey;

/// Authentication methods the server advertised as acceptable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvailableMethods {
    pub password: bool,
    pub public_key: bool,
}

impl AvailableMethods {
    pub const ALL: AvailableMethods = AvailableMethods {
        password: true,
        public_key: true,
    };

    pub fn from_method_set(methods: &MethodSet) -> Self {
        Self {
            password: methods.contains(&MethodKind::Password),
            public_key: methods.contains(&MethodKind::PublicKey),
        }
    }
}

/// What gets presented to the server
pub enum OfferKind {
    Password(Zeroizing<String>),
    PublicKey(SigningKey),
    /// Agent identities are enumerated during the exchange itself
    Agent,
}

/// A single authentication offer
pub struct AuthOffer {
    pub username: String,
    /// Left empty; the transport fills in "ssh-connection"
    pub service_name: String,
    pub kind: OfferKind,
}

impl AuthOffer {
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            OfferKind::Password(_) => "password",
            OfferKind::PublicKey(_) => "publickey",
            OfferKind::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOffer")
            .field("username", &self.username)
            .field("service_name", &self.service_name)
            .field("kind", &self.kind_label())
            .finish()
    }
}

/// Produces authentication offers from the configured credential
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    username: String,
    credential: Credential,
}

impl CredentialProvider {
    pub fn new(username: impl Into<String>, credential: Credential) -> Self {
        Self {
            username: username.into(),
            credential,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Build the offer matching the configured credential.
    ///
    /// Fails when the server does not accept that credential's method, or
    /// when a private key cannot be decoded.
    pub async fn next_offer(&self, available: &AvailableMethods) -> Result<AuthOffer, TunnelError> {
        let kind = match &self.credential {
            Credential::Password { password } => {
                if !available.password {
                    return Err(TunnelError::PasswordAuthenticationNotSupported);
                }
                OfferKind::Password(Zeroizing::new(password.clone()))
            }
            Credential::PrivateKey { pem, passphrase } => {
                if !available.public_key {
                    return Err(TunnelError::PublicKeyAuthenticationNotSupported);
                }
                let pem = Zeroizing::new(pem.clone());
                let passphrase = passphrase.clone().map(Zeroizing::new);
                // Key decoding (and bcrypt-pbkdf for encrypted keys) is CPU bound
                let key = tokio::task::spawn_blocking(move || {
                    SigningKey::decode_openssh(&pem, passphrase.as_deref().map(|p| p.as_str()))
                })
                .await
                .map_err(|e| TunnelError::Other(format!("key decoding task failed: {}", e)))??;
                OfferKind::PublicKey(key)
            }
            Credential::Agent => {
                if !available.public_key {
                    return Err(TunnelError::PublicKeyAuthenticationNotSupported);
                }
                OfferKind::Agent
            }
        };

        let offer = AuthOffer {
            username: self.username.clone(),
            service_name: String::new(),
            kind,
        };
        debug!("Prepared {} offer for {}", offer.kind_label(), offer.username);
        Ok(offer)
    }
}
