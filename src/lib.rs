//! sshtunnel - SSH local port forwarding
//!
//! Opens an SSH session, listens on a local port, and relays every accepted
//! connection through a `direct-tcpip` channel to a target host reachable
//! from the SSH server.
//!
//! ```no_run
//! use sshtunnel::{Credential, SshTunnel, TunnelConfig};
//!
//! # async fn run() -> Result<(), sshtunnel::TunnelError> {
//! let config = TunnelConfig::new(
//!     "bastion.example.com",
//!     22,
//!     "deploy",
//!     Credential::password("secret"),
//!     "db.internal",
//!     5432,
//! );
//! let tunnel = SshTunnel::connect(config).await?;
//! println!("postgres is reachable on localhost:{}", tunnel.local_port());
//! tunnel.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod forwarding;
pub mod ssh;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use ssh::{Credential, HostKeyPolicy, TunnelConfig, TunnelError};
pub use tunnel::{BlockingTunnel, SshTunnel, TunnelState};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
