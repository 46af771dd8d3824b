//! Wrapper crate templates.
//!
//! A tool's source is a single `tool.rs`. To build it, the pipeline
//! materializes a throwaway crate that links that file against the sdk and
//! supplies `main`.

use std::path::Path;

/// The generated crate around one tool. The rewritten tool source is
/// written to `src/tool.rs` next to these files.
#[derive(Debug, Clone)]
pub struct WrapperCrate {
    tool_name: String,
    sdk_path: String,
}

impl WrapperCrate {
    pub fn new(tool_name: impl Into<String>, sdk_dir: &Path) -> Self {
        Self {
            tool_name: tool_name.into(),
            sdk_path: toml_path(sdk_dir),
        }
    }

    /// `(relative path, content)` of every generated file.
    pub fn files(&self) -> [(&'static str, String); 2] {
        let vars = [
            ("tool_name", self.tool_name.as_str()),
            ("sdk_path", self.sdk_path.as_str()),
        ];
        [
            ("Cargo.toml", render(WRAPPER_CARGO_TOML, &vars)),
            ("src/main.rs", render(WRAPPER_MAIN_RS, &vars)),
        ]
    }
}

/// Substitute `{{key}}` placeholders in one pass. Unknown keys stay as
/// written, and substituted text is never scanned again.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Quote a filesystem path as a TOML basic string.
pub fn toml_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

const WRAPPER_CARGO_TOML: &str = r##"[package]
name = "tool_{{tool_name}}"
version = "0.1.0"
edition = "2021"
publish = false

[[bin]]
name = "{{tool_name}}"
path = "src/main.rs"

[dependencies]
toolsmith-sdk = { path = {{sdk_path}} }
serde = { version = "1", features = ["derive"] }
serde_json = "1"

[workspace]
"##;

const WRAPPER_MAIN_RS: &str = r##"#![allow(non_camel_case_types)]

mod tool;

fn main() {
    toolsmith_sdk::run_tool(|params: tool::{{tool_name}}| params.run())
}
"##;
