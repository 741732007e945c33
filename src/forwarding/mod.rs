//! Port Forwarding Module
//!
//! Local port forwarding: a listener on a local address, and a relay that
//! splices each accepted socket with a forwarded SSH channel.

mod channel_data;
mod listener;
mod registry;
pub mod splice;

pub use channel_data::{ChannelDataReader, ChannelDataWriter};
pub use listener::{ConnectionForwarder, LocalForwardListener};
pub use registry::{ChannelPairRegistry, ForwardStats, PairGuard, PairId, PairInfo};
pub use splice::{
    matched_pair, splice, CloseReason, EndpointReport, IoEndpoint, PairCloser, SpliceReport,
    SpliceStream,
};
