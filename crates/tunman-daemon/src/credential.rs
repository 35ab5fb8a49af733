//! Private key resolution.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::artifact::EphemeralFile;

/// The identity handed to the transport via `-i`.
#[derive(Debug)]
pub enum Identity {
    /// No key configured; the transport uses its defaults.
    None,
    /// A key file that already exists on disk.
    Path(PathBuf),
    /// Inline key content written out for this launch only.
    Ephemeral(EphemeralFile),
}

impl Identity {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::None => None,
            Self::Path(path) => Some(path.as_path()),
            Self::Ephemeral(file) => Some(file.path()),
        }
    }

    /// Remove an ephemeral key file now. No-op for other variants.
    pub fn release(self) -> std::io::Result<()> {
        match self {
            Self::Ephemeral(file) => file.close(),
            Self::None | Self::Path(_) => Ok(()),
        }
    }
}

/// Resolve the identity for a launch.
///
/// A non-empty `private_key_path` wins. Otherwise non-empty
/// `private_key_content` is written to an ephemeral file under `dir`, or the
/// system temp dir when `dir` is `None`.
pub fn materialize(
    private_key_path: Option<&str>,
    private_key_content: Option<&str>,
    dir: Option<&Path>,
) -> std::io::Result<Identity> {
    if let Some(path) = private_key_path.filter(|p| !p.is_empty()) {
        return Ok(Identity::Path(PathBuf::from(path)));
    }
    match private_key_content.filter(|c| !c.is_empty()) {
        Some(content) => {
            info!("Writing inline private key to ephemeral file");
            let file = EphemeralFile::create_in(dir, "tunman-identity-", content.as_bytes())?;
            Ok(Identity::Ephemeral(file))
        }
        None => Ok(Identity::None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn path_wins_over_content() {
        let identity = materialize(Some("/home/u/.ssh/id"), Some("KEY"), None).unwrap();
        assert!(matches!(identity, Identity::Path(_)));
        assert_eq!(identity.path(), Some(Path::new("/home/u/.ssh/id")));
    }

    #[test]
    fn content_is_written_when_path_is_empty() {
        let identity = materialize(Some(""), Some("-----BEGIN KEY-----\n"), None).unwrap();
        let path = identity.path().unwrap().to_path_buf();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "-----BEGIN KEY-----\n"
        );
        drop(identity);
        assert!(!path.exists());
    }

    #[test]
    fn release_removes_ephemeral_key() {
        let identity = materialize(None, Some("KEY"), None).unwrap();
        let path = identity.path().unwrap().to_path_buf();
        identity.release().unwrap();
        assert!(!path.exists());
        assert!(materialize(Some("/k"), None, None).unwrap().release().is_ok());
    }

    #[test]
    fn nothing_configured_yields_no_identity() {
        assert!(materialize(None, None, None).unwrap().path().is_none());
        assert!(materialize(None, Some(""), None).unwrap().path().is_none());
    }
}
