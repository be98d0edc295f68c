//! # Shared Types Crate
//!
//! This crate contains the data model shared across the Trireme control
//! plane: the normalized monitor events, the per-PU runtime description,
//! the resolved policy and the secret material handed to enforcers.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-crate types are defined here.
//! - **Deep Copies at the Seams**: Readers of a `PuRuntime` or `PuPolicy`
//!   obtain owned copies; there is no shared mutation across components.
//! - **Stable Identifiers**: The `pu_id`/`context_id` of a processing unit
//!   is unique and stable for the PU's full lifetime.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod collector;
pub mod errors;
pub mod events;
pub mod policy;
pub mod runtime;
pub mod secrets;

pub use collector::{Collector, DefaultCollector};
pub use errors::TriremeError;
pub use events::{EventInfo, EventType};
pub use policy::{
    FilterQueue, IpMap, IpRule, IpRuleList, KeyValueOperator, Operator, PolicyAction, PuInfo,
    PuPolicy, PuState, TagMap, TagSelector, TagSelectorList,
};
pub use runtime::PuRuntime;
pub use secrets::{PkiSecrets, PskSecrets, PublicKeyAdder, Secrets, SecretsType};

/// The namespace key under which a PU's primary address is stored.
pub const DEFAULT_NAMESPACE: &str = "";
