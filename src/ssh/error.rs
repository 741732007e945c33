//! Tunnel error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Password authentication not supported by server")]
    PasswordAuthenticationNotSupported,

    #[error("Public key authentication not supported by server")]
    PublicKeyAuthenticationNotSupported,

    #[error("Invalid channel type")]
    InvalidChannelType,

    #[error("Invalid channel data")]
    InvalidData,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    /// True for errors produced while negotiating credentials with the server.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            TunnelError::PasswordAuthenticationNotSupported
                | TunnelError::PublicKeyAuthenticationNotSupported
                | TunnelError::AuthenticationFailed(_)
                | TunnelError::KeyError(_)
                | TunnelError::AgentNotAvailable(_)
                | TunnelError::AgentError(_)
        )
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        TunnelError::KeyError(err.to_string())
    }
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
