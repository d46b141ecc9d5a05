//! Per-execution staging directory.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::harness::SCRIPT_FILE_NAME;

/// A fresh temporary directory holding exactly one file: the submission.
///
/// The directory is removed when this value is dropped, on every path.
/// [`StagedScript::close`] does the same but reports failures.
#[derive(Debug)]
pub struct StagedScript {
    dir: TempDir,
    script_path: PathBuf,
}

impl StagedScript {
    /// Create the directory and write `source` verbatim as UTF-8.
    pub fn create(source: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("pyrun-").tempdir()?;
        let script_path = dir.path().join(SCRIPT_FILE_NAME);
        std::fs::write(&script_path, source)?;
        Ok(Self { dir, script_path })
    }

    /// The staging directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The staged script file.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Remove the directory now, logging instead of failing.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_single_file_verbatim() {
        let source = "def main():\n    return 'héllo'\n";
        let staged = StagedScript::create(source).unwrap();
        assert_eq!(std::fs::read_to_string(staged.script_path()).unwrap(), source);
        let entries: Vec<_> = std::fs::read_dir(staged.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(staged.script_path().file_name().unwrap(), SCRIPT_FILE_NAME);
    }

    #[test]
    fn close_removes_directory() {
        let staged = StagedScript::create("x = 1\n").unwrap();
        let dir = staged.dir().to_path_buf();
        staged.close();
        assert!(!dir.exists());
    }

    #[test]
    fn drop_removes_directory() {
        let dir = {
            let staged = StagedScript::create("x = 1\n").unwrap();
            staged.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn each_staging_is_distinct() {
        let a = StagedScript::create("a = 1\n").unwrap();
        let b = StagedScript::create("b = 2\n").unwrap();
        assert_ne!(a.dir(), b.dir());
    }
}
