//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::auth::{AvailableMethods, CredentialProvider, OfferKind};
use super::config::TunnelConfig;
use super::error::TunnelError;
use super::host_key::HostKeyPolicy;

/// Connects and authenticates an SSH session for a tunnel
pub struct SshClient {
    config: Arc<TunnelConfig>,
}

impl SshClient {
    pub fn new(config: Arc<TunnelConfig>) -> Self {
        Self { config }
    }

    /// Open the TCP connection and complete the SSH handshake
    pub async fn connect(&self) -> Result<Handle<ClientHandler>, TunnelError> {
        let addr = self.config.server_addr();
        info!("Connecting to SSH server at {}", addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval(),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_policy.clone(),
        );

        let connect = client::connect(
            Arc::new(ssh_config),
            (self.config.host.as_str(), self.config.port),
            handler,
        );
        let result = match self.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| timed_out("connecting to", &addr, limit))?,
            None => connect.await,
        };

        let handle = result.map_err(|e| match e {
            TunnelError::HostKeyRejected(_) => e,
            other => TunnelError::ConnectionFailed(format!("{}: {}", addr, other)),
        })?;

        debug!("SSH handshake completed with {}", addr);
        Ok(handle)
    }

    /// Run the authentication exchange on a connected handle
    pub async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
    ) -> Result<(), TunnelError> {
        let auth = self.exchange(handle);
        match self.config.auth_timeout() {
            Some(limit) => tokio::time::timeout(limit, auth)
                .await
                .map_err(|_| timed_out("authenticating with", &self.config.server_addr(), limit))?,
            None => auth.await,
        }
    }

    async fn exchange(&self, handle: &mut Handle<ClientHandler>) -> Result<(), TunnelError> {
        let provider =
            CredentialProvider::new(self.config.username.clone(), self.config.credential.clone());

        // "none" is how the server tells us which methods it accepts
        let available = match handle.authenticate_none(provider.username()).await? {
            AuthResult::Success => {
                info!("Server accepted {} without credentials", provider.username());
                return Ok(());
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => AvailableMethods::from_method_set(&remaining_methods),
        };
        debug!("Server accepts {:?}", available);

        let offer = provider.next_offer(&available).await?;
        debug!("Offering {:?}", offer);

        let result = match offer.kind {
            OfferKind::Password(password) => {
                handle
                    .authenticate_password(&offer.username, password.as_str())
                    .await?
            }
            OfferKind::PublicKey(key) => {
                let private = key.private_key().ok_or_else(|| {
                    TunnelError::KeyError("key has no in-process private half".to_string())
                })?;
                handle
                    .authenticate_publickey(
                        &offer.username,
                        PrivateKeyWithHashAlg::new(private, None),
                    )
                    .await?
            }
            OfferKind::Agent => {
                let mut agent = SshAgentClient::connect().await?;
                agent.authenticate(handle, &offer.username).await?;
                AuthResult::Success
            }
        };

        if !result.success() {
            return Err(TunnelError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", offer.username);
        Ok(())
    }
}

fn timed_out(action: &str, addr: &str, limit: Duration) -> TunnelError {
    TunnelError::Timeout(format!("{} {} after {}s", action, addr, limit.as_secs()))
}

/// Client handler for russh callbacks
///
/// Only the host key check matters for a local forward; the server never
/// opens channels towards us.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy.check(&self.host, self.port, server_public_key) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Refusing SSH session to {}:{}: {}", self.host, self.port, e);
                Err(e)
            }
        }
    }
}
