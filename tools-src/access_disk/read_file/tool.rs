use std::fs;

use serde::Deserialize;

/// Read a text file from the shared data directory.
#[derive(Deserialize)]
pub struct read_file {
    /// Path of the file, relative to the working directory (for example disk/notes.txt).
    pub path: String,
}

impl read_file {
    pub fn run(&self) -> String {
        match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => panic!("cannot read {}: {}", self.path, e),
        }
    }
}
