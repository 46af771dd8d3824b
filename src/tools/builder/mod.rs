//! Compiling tool sources into sandboxed executables.
//!
//! - `schema` derives the tool descriptor from the parameter struct
//! - `fingerprint` decides when an artifact is stale
//! - `templates` renders the wrapper crate around `tool.rs`
//! - `pipeline` drives rewrite, compile and install

mod fingerprint;
mod pipeline;
mod schema;
mod templates;

pub use fingerprint::{Fingerprint, is_stale};
pub use pipeline::{ARTIFACT_FILE, BuildPhase, SOURCE_FILE, STAMP_FILE, ToolBuilder};
pub use schema::extract_descriptor;
pub use templates::{WrapperCrate, toml_path};
