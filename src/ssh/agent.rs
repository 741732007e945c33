//! SSH Agent credential
//!
//! Keys held by the system SSH agent (including hardware-backed keys exposed
//! through an agent) never leave it: russh asks the agent to sign the
//! server's challenge through [`AgentSigner`].
//!
//! # Platform Support
//! - **Unix/Linux/macOS**: `SSH_AUTH_SOCK` Unix domain socket
//! - **Windows**: `\\.\pipe\openssh-ssh-agent` named pipe (OpenSSH for Windows)
//!
//! # The `AgentSigner` wrapper
//!
//! russh's built-in `impl Signer for AgentClient` borrows the requested
//! `PublicKey` across an `.await`, which the compiler cannot prove `Send`
//! through RPITIT (rust-lang/rust#100013). The wrapper clones the key before
//! the async block so the future only captures owned values.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::TunnelError;
use super::keys::SigningKey;

struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// SSH Agent client wrapper
///
/// Wraps russh's `AgentClient` with a type-erased stream for cross-platform support.
pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the system SSH Agent
    pub async fn connect() -> Result<Self, TunnelError> {
        info!("Connecting to system SSH Agent");

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                TunnelError::AgentNotAvailable(format!(
                    "Failed to connect to SSH Agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    TunnelError::AgentNotAvailable(format!(
                        "Failed to connect to SSH Agent via named pipe: {}",
                        e
                    ))
                })?;
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(TunnelError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Authenticate with the first agent key the server accepts.
    ///
    /// Only Ed25519 and NIST P-curve ECDSA identities are offered; anything
    /// else the agent holds is skipped.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), TunnelError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| TunnelError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        let usable: Vec<_> = keys
            .into_iter()
            .filter(|key| match SigningKey::Agent(key.clone()).method() {
                Some(_) => true,
                None => {
                    debug!("Skipping agent key {} ({})", key.comment(), key.algorithm());
                    false
                }
            })
            .collect();

        if usable.is_empty() {
            return Err(TunnelError::AgentError(
                "SSH Agent holds no Ed25519 or ECDSA keys".to_string(),
            ));
        }

        info!("Trying {} agent key(s)", usable.len());

        let mut last_error: Option<String> = None;
        for key in &usable {
            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("SSH Agent authentication succeeded with key: {}", key.comment());
                    return Ok(());
                }
                Ok(_) => {
                    debug!("Key rejected by server: {}", key.comment());
                }
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(TunnelError::AuthenticationFailed(format!(
            "no agent key was accepted by the server (tried {}){}",
            usable.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_connect_reports_unavailable() {
        match SshAgentClient::connect().await {
            Ok(_) => {} // an agent is running on this machine
            Err(TunnelError::AgentNotAvailable(_)) => {}
            Err(e) => panic!("Unexpected error type: {:?}", e),
        }
    }
}
