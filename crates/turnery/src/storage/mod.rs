//! In-memory reference backends for the collaborator traits.
//!
//! Used by tests and single-process deployments. Durable backends implement
//! the same traits against real storage.

pub mod memory_reminders;
pub mod memory_state;
