//! # RPC Wrapper
//!
//! Carries structured requests between a server (a per-PU enforcer child
//! or the RPC monitor) and its clients over AF_UNIX stream sockets, with
//! per-channel HMAC authentication.
//!
//! ## Wire format
//!
//! Frames are a u32 big-endian length followed by a JSON document. A
//! request is `Request { hash_auth, payload }` where `hash_auth` is
//! HMAC-SHA256 over the canonical serialization of `payload`, keyed by
//! the channel's shared secret. The server rejects any request whose
//! authenticator does not verify, answering `Unauthenticated` without
//! invoking the handler.
//!
//! ## Channels
//!
//! Every client channel rotates its secret at creation, so a token
//! captured before a restart cannot be replayed into the new channel.
//! The secret crosses to the serving side out of band (the process
//! manager passes it to children through their environment).

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod client;
pub mod envelope;
mod frame;
pub mod server;

pub use auth::{check_validity, generate_secret, sign_payload, signed_request};
pub use client::RpcClientManager;
pub use envelope::{
    EnforcePayload, EnforcerExitPayload, FlowRecord, InitRequestPayload, InitSupervisorPayload,
    Request, RequestPayload, Response, RpcStatus, StatsPayload, SupervisePayload,
    UnEnforcePayload, UnSupervisePayload,
};
pub use server::{RpcHandler, RpcServer};

use thiserror::Error;

/// Socket the per-PU children report flow stats on.
pub const STATS_CHANNEL: &str = "/tmp/statschannel.sock";

/// Environment variable carrying a channel secret to a child, hex encoded.
pub const ENV_RPC_SECRET: &str = "TRIREME_RPC_SECRET";

/// Environment variable carrying the stats channel secret, hex encoded.
pub const ENV_STATS_SECRET: &str = "STATSCHANNEL_SECRET";

/// Deadline applied to a remote call end to end.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 5;

/// Errors from the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No channel registered under the requested key.
    #[error("No RPC client for key {0}")]
    NoSuchClient(String),

    /// Socket-level failure.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The call deadline elapsed. Callers treat this as `Unavailable`.
    #[error("RPC call timed out")]
    Timeout,

    /// The peer rejected our authenticator.
    #[error("Peer rejected request as unauthenticated")]
    Unauthenticated,

    /// The peer executed the request and reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A frame could not be encoded or decoded.
    #[error("Codec failure: {0}")]
    Codec(String),

    /// An incoming frame exceeded the size bound.
    #[error("Frame of {0} bytes exceeds limit")]
    Oversize(u32),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}
