//! Credential store.
//!
//! Tools never see raw credentials in their prompts. The user registers a
//! secret once, gets back a random id, and hands the id to the agent; a tool
//! resolves the id through opcode 5 at the moment it needs the value.

mod store;

pub use store::{ID_BYTES, SecretStore};
