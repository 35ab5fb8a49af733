//! Short-lived files handed to the transport on its command line.

use std::io::Write;
use std::path::Path;

use tempfile::TempPath;
use tracing::{debug, warn};

/// A temporary file owned by exactly one launch.
///
/// Created with owner-only permissions on Unix. The file is removed when the
/// value is dropped, whichever way the owning scope ends.
#[derive(Debug)]
pub struct EphemeralFile {
    path: TempPath,
}

impl EphemeralFile {
    /// Create a new file under the system temp dir holding `contents` verbatim.
    pub fn create(prefix: &str, contents: &[u8]) -> std::io::Result<Self> {
        Self::create_in(None, prefix, contents)
    }

    /// Like [`EphemeralFile::create`], but under `dir` when one is given.
    pub fn create_in(dir: Option<&Path>, prefix: &str, contents: &[u8]) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(contents)?;
        file.flush()?;
        let path = file.into_temp_path();
        debug!(path = %path.display(), "Created ephemeral file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now, reporting failure instead of swallowing it.
    pub fn close(self) -> std::io::Result<()> {
        let shown = self.path.display().to_string();
        self.path.close().inspect_err(|e| {
            warn!(path = %shown, error = %e, "Failed to remove ephemeral file");
        })
    }
}
