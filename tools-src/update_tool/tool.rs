use serde::Deserialize;

/// Update a tool's code according to a prompt.
#[derive(Deserialize)]
pub struct update_tool {
    /// Tool name.
    pub name: String,
    /// How to change the code: fix a bug, add functionality, change parameters.
    pub prompt: String,
}

const SYSTEM_PROMPT: &str = "You are a programming assistant who is precise and follows the user's requirements carefully. You write Rust.";

impl update_tool {
    pub fn run(&self) -> String {
        let tools_dir =
            std::env::var("TOOLSMITH_TOOLS_DIR").unwrap_or_else(|_| "tools-src".to_string());
        let path = std::path::Path::new(&tools_dir)
            .join(&self.name)
            .join("tool.rs");
        let code = match std::fs::read_to_string(&path) {
            Ok(code) => code,
            Err(e) => panic!("cannot read {}: {}", path.display(), e),
        };

        let user_prompt = format!(
            "This is the prompt from the user:\n{prompt}\n\n\
             Based on this prompt, modify this code:\n```rust\n{code}\n```\n\n\
             If an error occurs, panic with a clear message. Review the tool and parameter \
             descriptions and update them if needed. Keep the signature of the `run` method. \
             Output only code, no explanation. Implement everything, no placeholders. \
             Do not add a main function.",
            prompt = self.prompt,
            code = code
        );

        let answer = toolsmith_sdk::run_agent("coder", 20, 20000, SYSTEM_PROMPT, &user_prompt);

        let Some(code) = extract_code(&answer) else {
            return "failed: the coder answered without a ```rust block".to_string();
        };
        let diagnostics = toolsmith_sdk::set_tool_code(&self.name, code);
        if diagnostics.is_empty() {
            "success".to_string()
        } else {
            diagnostics
        }
    }
}

fn extract_code(answer: &str) -> Option<&str> {
    let start = answer.find("```rust")? + "```rust".len();
    let rest = &answer[start..];
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}
