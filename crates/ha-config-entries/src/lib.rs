//! Config Entries
//!
//! Config entries represent individual integration instances and manage
//! their lifecycle (setup, unload, reload, retry).
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`EntryHandler`] - Integration hooks invoked by the manager

pub mod entry;
pub mod manager;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};

pub use manager::{
    ConfigEntries, ConfigEntriesError, ConfigEntriesResult, EntryHandler, SetupFailure,
};

pub use state_machine::{calculate_retry_delay, InvalidTransition};
