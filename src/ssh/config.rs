//! Tunnel Configuration

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::error::TunnelError;
use super::host_key::HostKeyPolicy;

/// Local port forwarding tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// SSH server address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Exactly one credential form
    pub credential: Credential,

    /// Host the SSH server connects to on our behalf
    pub target_host: String,

    /// Port on the target host
    pub target_port: u16,

    /// Local address to listen on (default: "localhost")
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Local port to listen on (default: 0, ephemeral)
    #[serde(default)]
    pub bind_port: u16,

    /// TCP connect + SSH handshake timeout in seconds (None: wait indefinitely)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Authentication timeout in seconds (None: wait indefinitely)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_timeout_secs: Option<u64>,

    /// direct-tcpip channel open timeout in seconds (None: wait indefinitely)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_open_timeout_secs: Option<u64>,

    /// SSH keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: Option<u64>,

    /// How the server's host key is validated
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Depth of each relay endpoint's mailbox, in read batches
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

/// Credential presented to the SSH server
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication
    Password { password: String },

    /// Private key in OpenSSH PEM text form
    PrivateKey {
        pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },

    /// Key held by the system SSH agent (including hardware-backed keys)
    Agent,
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn private_key(pem: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKey {
            pem: pem.into(),
            passphrase,
        }
    }

    /// Build a credential from the optional password / private key pair.
    ///
    /// Exactly one of the two must be present.
    pub fn from_parts(
        password: Option<String>,
        private_key: Option<String>,
    ) -> Result<Self, TunnelError> {
        match (password, private_key) {
            (Some(password), None) => Ok(Self::password(password)),
            (None, Some(pem)) => Ok(Self::private_key(pem, None)),
            (Some(_), Some(_)) => Err(TunnelError::Configuration(
                "password and private key are mutually exclusive".to_string(),
            )),
            (None, None) => Err(TunnelError::Configuration(
                "either a password or a private key is required".to_string(),
            )),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::PrivateKey { .. } => "private-key",
            Credential::Agent => "agent",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            Credential::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"<redacted>")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        match self {
            Credential::Password { password } => password.zeroize(),
            Credential::PrivateKey { pem, passphrase } => {
                pem.zeroize();
                if let Some(p) = passphrase {
                    p.zeroize();
                }
            }
            Credential::Agent => {}
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_bind_host() -> String {
    "localhost".to_string()
}

fn default_keepalive() -> Option<u64> {
    Some(30)
}

fn default_channel_buffer() -> usize {
    8
}

impl TunnelConfig {
    /// Create a configuration with default bind address and no timeouts
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: Credential,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credential,
            target_host: target_host.into(),
            target_port,
            bind_host: default_bind_host(),
            bind_port: 0,
            connect_timeout_secs: None,
            auth_timeout_secs: None,
            channel_open_timeout_secs: None,
            keepalive_interval_secs: default_keepalive(),
            host_key_policy: HostKeyPolicy::default(),
            channel_buffer: default_channel_buffer(),
        }
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TunnelError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TunnelError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the fields serde cannot
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.host.trim().is_empty() {
            return Err(TunnelError::Configuration("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(TunnelError::Configuration("port must be non-zero".to_string()));
        }
        if self.username.is_empty() {
            return Err(TunnelError::Configuration("username is empty".to_string()));
        }
        if self.target_host.trim().is_empty() {
            return Err(TunnelError::Configuration("target_host is empty".to_string()));
        }
        if self.target_port == 0 {
            return Err(TunnelError::Configuration(
                "target_port must be non-zero".to_string(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(TunnelError::Configuration(
                "channel_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.bind_port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_channel_open_timeout(mut self, timeout: Duration) -> Self {
        self.channel_open_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        self.auth_timeout_secs.map(Duration::from_secs)
    }

    pub fn channel_open_timeout(&self) -> Option<Duration> {
        self.channel_open_timeout_secs.map(Duration::from_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_secs.map(Duration::from_secs)
    }

    /// "host:port" of the SSH server, for logs
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
