//! Opening disk images from the local filesystem.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::paths::{expand_tilde, open_parent};
use crate::request::ImageReader;

/// Errors raised while opening a local image.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LocalImageError {
    /// Raised when the file or its directory cannot be opened.
    #[error("failed to open image {path}: {message}")]
    Open {
        /// Path as resolved after tilde expansion.
        path: String,
        /// Error message from the operating system.
        message: String,
    },
    /// Raised when the path names something other than a regular file.
    #[error("image {path} is not a regular file")]
    NotAFile {
        /// Path as resolved after tilde expansion.
        path: String,
    },
}

/// Local image opened for streaming.
pub struct LocalImage {
    /// Byte stream over the file contents.
    pub reader: ImageReader,
    /// File size in bytes.
    pub size: u64,
}

impl std::fmt::Debug for LocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalImage")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Opens the image at `path` for reading. A leading `~/` is expanded.
///
/// The path is canonicalised first, so relative paths that climb out of the
/// current directory and symlinks into other directories both resolve.
///
/// # Errors
///
/// Returns [`LocalImageError`] when the file is missing, unreadable or not a
/// regular file.
pub fn open_local_image(path: &str) -> Result<LocalImage, LocalImageError> {
    let resolved = Utf8PathBuf::from(expand_tilde(path));
    let open_error = |message: String| LocalImageError::Open {
        path: resolved.to_string(),
        message,
    };

    let canonical = resolved
        .canonicalize_utf8()
        .map_err(|err| open_error(err.to_string()))?;
    let (dir, file_name) = open_parent(&canonical).map_err(open_error)?;
    let file = dir
        .open(file_name)
        .map_err(|err| open_error(err.to_string()))?;
    let metadata = file
        .metadata()
        .map_err(|err| open_error(err.to_string()))?;
    if !metadata.is_file() {
        return Err(LocalImageError::NotAFile {
            path: resolved.to_string(),
        });
    }

    let std_file = file.into_std();
    Ok(LocalImage {
        reader: Box::new(tokio::fs::File::from_std(std_file)),
        size: metadata.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn opens_file_and_reports_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.raw");
        std::fs::write(&file, b"raw disk").expect("write image");

        let image = open_local_image(file.to_str().expect("utf8 path")).expect("open image");
        assert_eq!(image.size, 8);

        let mut reader = image.reader;
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.expect("read image");
        assert_eq!(contents, b"raw disk");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("absent.raw");

        let err = open_local_image(file.to_str().expect("utf8 path")).expect_err("missing");
        assert!(matches!(err, LocalImageError::Open { .. }), "{err:?}");
    }

    #[test]
    fn directories_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).expect("create dir");

        let err = open_local_image(nested.to_str().expect("utf8 path")).expect_err("directory");
        assert!(matches!(err, LocalImageError::NotAFile { .. }), "{err:?}");
    }

    /// Spells `target` as a path relative to the current directory that
    /// climbs to the filesystem root first.
    fn relative_from_cwd(target: &std::path::Path) -> String {
        let cwd = std::env::current_dir().expect("current dir");
        let depth = cwd.components().skip(1).count();
        let stripped = target.strip_prefix("/").expect("absolute target");
        format!("{}{}", "../".repeat(depth), stripped.display())
    }

    #[test]
    fn relative_paths_may_leave_the_current_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.raw");
        std::fs::write(&file, b"raw").expect("write image");

        let relative = relative_from_cwd(&file);
        assert!(!relative.starts_with('/'), "{relative}");

        let image = open_local_image(&relative).expect("open image");
        assert_eq!(image.size, 3);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_into_other_directories_resolve() {
        let target_dir = tempfile::tempdir().expect("target dir");
        let link_dir = tempfile::tempdir().expect("link dir");
        let target = target_dir.path().join("disk.raw");
        std::fs::write(&target, b"linked disk").expect("write image");
        let link = link_dir.path().join("disk.raw");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        let image = open_local_image(link.to_str().expect("utf8 path")).expect("open image");
        assert_eq!(image.size, 11);
    }
}
