use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Search for or change the user's and device data stored on disk.
#[derive(Deserialize)]
pub struct access_disk {
    /// The action (read, update, insert or delete), the place or hints where the data could be stored and, when writing, the value to store.
    pub description: String,
}

const DATA_DIR: &str = "disk";
const MAX_LISTED: usize = 200;

const SYSTEM_PROMPT: &str = "You are an assistant who is precise and carefully follows the user's requirements. You manage files. You use tools all the time.";

impl access_disk {
    pub fn run(&self) -> String {
        let mut files = Vec::new();
        list_files(Path::new(DATA_DIR), &mut files);
        files.sort();
        let listing = if files.is_empty() {
            "(no files yet)".to_string()
        } else {
            files.join("\n")
        };

        let user_prompt = format!(
            "These files exist under the `{DATA_DIR}` directory:\n{listing}\n\n\
             This is the prompt from the user:\n{description}\n\n\
             Use the tools 'read_file', 'write_file' and 'delete_file' to carry out the prompt. \
             Only paths under `{DATA_DIR}` are accessible. Look at the data returned and if it \
             does not answer the prompt, try other files. Create the answer from what you found. \
             If a value was read, describe the file it came from.",
            description = self.description
        );

        toolsmith_sdk::run_agent("agent", 20, 20000, SYSTEM_PROMPT, &user_prompt)
    }
}

fn list_files(dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= MAX_LISTED {
            return;
        }
        let path = entry.path();
        if path.is_dir() {
            list_files(&path, out);
        } else {
            out.push(path.display().to_string());
        }
    }
}
