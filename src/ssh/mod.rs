//! SSH module - connection, authentication and channels
//!
//! This module provides the SSH side of a tunnel using the russh library.
//!
//! # Features
//! - Password, private key (Ed25519 / ECDSA) and SSH agent authentication
//! - Host key policy: accept-any or pinned SHA-256 fingerprints
//! - Single-owner tasks for the session handle and each forwarded channel

mod agent;
mod auth;
mod channel_owner;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod host_key;
mod keys;
mod transport;

pub use agent::SshAgentClient;
pub use auth::{AuthOffer, AvailableMethods, CredentialProvider, OfferKind};
pub use channel_owner::spawn_channel_owner;
pub use client::{ClientHandler, SshClient};
pub use config::{Credential, TunnelConfig};
pub use error::TunnelError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_key::HostKeyPolicy;
pub use keys::{AuthenticationMethod, SigningKey};
pub use transport::{ChannelCommand, ChannelEnvelope, ForwardingTransport, RemoteChannel};

#[cfg(test)]
pub(crate) use keys::fixtures;
