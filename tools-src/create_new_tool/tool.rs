use serde::Deserialize;

/// Create a new tool from a description.
#[derive(Deserialize)]
pub struct create_new_tool {
    /// Tool name. Letters, digits and underscores only, no spaces.
    pub name: String,
    /// What the tool should do: its parameters (name, type, description) and a detailed description of its behavior.
    pub description: String,
}

const SYSTEM_PROMPT: &str = "You are a programming assistant who is precise and follows the user's requirements carefully. You write Rust.";

impl create_new_tool {
    pub fn run(&self) -> String {
        let template = format!(
            r#"use serde::Deserialize;

/// <tool_description>
#[derive(Deserialize)]
pub struct {name} {{
    <parameters, each with a /// description>
}}

impl {name} {{
    pub fn run(&self) -> <return_type> {{
        <implementation>
    }}
}}"#,
            name = self.name
        );

        let user_prompt = format!(
            "These are the available APIs:\n\
             // Converts a password id into the password when logging in to a service.\n\
             toolsmith_sdk::get_password(id: &str) -> String\n\n\
             Only the `serde`, `serde_json` and `toolsmith_sdk` crates are available. \
             Files may only be written under the `disk` directory.\n\n\
             This is the file template:\n```rust\n{template}\n```\n\n\
             This is the prompt from the user:\n{description}\n\n\
             Based on the user's prompt, fill in the template.\n\
             <return_type> must be one serializable type. If unsure, return String with \"success\".\n\
             Parameters must be String or numbers. You may add more parameters than the prompt mentions. \
             The code must not contain placeholders or constants a programmer would have to change later \
             (example.com and the like). Write production ready code only.\n\
             If an error occurs, panic with a clear message. Output only the filled in template. \
             Do not add a main function.",
            template = template,
            description = self.description
        );

        let answer = toolsmith_sdk::run_agent("coder", 20, 20000, SYSTEM_PROMPT, &user_prompt);

        match extract_code(&answer) {
            Some(code) => {
                let diagnostics = toolsmith_sdk::set_tool_code(&self.name, code);
                if diagnostics.is_empty() {
                    "success".to_string()
                } else {
                    diagnostics
                }
            }
            None => "failed: the coder answered without a ```rust block".to_string(),
        }
    }
}

fn extract_code(answer: &str) -> Option<&str> {
    let start = answer.find("```rust")? + "```rust".len();
    let rest = &answer[start..];
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}
