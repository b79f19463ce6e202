//! Reactive game-state tree
//!
//! No game semantics live here beyond the default shape:
//! - `value`: tagged tree values and ordered association lists
//! - `path`: dot-path parsing
//! - `validation`: path/prefix-keyed rules consulted on write
//! - `store`: get/set/subscribe with history
//! - `defaults`: initial tree and baseline rules

pub mod defaults;
pub mod path;
pub mod store;
pub mod validation;
pub mod value;

pub use defaults::{REQUIRED_SECTIONS, default_store, default_tree, register_default_rules};
pub use store::{ChangeRecord, PathStore, SetOptions, SubscriptionId};
pub use validation::ValidationRegistry;
pub use value::{AssocList, Value, deep_merge};
