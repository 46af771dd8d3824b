use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Write a text file into the shared data directory, replacing any previous content.
#[derive(Deserialize)]
pub struct write_file {
    /// Path of the file, relative to the working directory (for example disk/notes.txt).
    pub path: String,
    /// Text to write.
    pub content: String,
}

impl write_file {
    pub fn run(&self) -> String {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    return format!("failed: {e}");
                }
            }
        }
        match fs::write(&self.path, &self.content) {
            Ok(()) => "success".to_string(),
            Err(e) => format!("failed: {e}"),
        }
    }
}
