use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Delete a file or a directory with everything in it from disk.
#[derive(Deserialize)]
pub struct delete_file {
    /// Path of the file or directory, relative to the working directory (for example disk/notes.txt).
    pub path: String,
}

impl delete_file {
    pub fn run(&self) -> String {
        let removed = if Path::new(&self.path).is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        match removed {
            Ok(()) => "success".to_string(),
            Err(e) => panic!("cannot delete {}: {}", self.path, e),
        }
    }
}
