//! Path helpers for files supplied on the command line.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
///
/// # Examples
///
/// ```
/// # use hcloud_upload_image::paths::expand_tilde;
/// assert_eq!(expand_tilde("/srv/image.raw"), "/srv/image.raw");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Opens the directory containing `path` with ambient authority and returns
/// it together with the file name relative to that directory.
///
/// A bare file name is looked up in the current directory.
///
/// # Errors
///
/// Returns a message when the path has no file name or the directory cannot
/// be opened.
pub(crate) fn open_parent(path: &Utf8Path) -> Result<(Dir, &Utf8Path), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let dir_path = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| format!("{dir_path}: {err}"))?;
    Ok((dir, Utf8Path::new(file_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/tmp/disk.img"), "/tmp/disk.img");
    }

    #[test]
    fn expand_tilde_uses_home() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        assert_eq!(
            expand_tilde("~/disk.img"),
            format!("{}/disk.img", home.to_string_lossy())
        );
    }

    #[test]
    fn open_parent_splits_absolute_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("image.raw");
        std::fs::write(&file, b"data").expect("write file");
        let path = camino::Utf8PathBuf::from_path_buf(file).expect("utf8 path");

        let (parent, name) = open_parent(&path).expect("open parent");
        assert_eq!(name, "image.raw");
        assert_eq!(parent.read_to_string(name).expect("read"), "data");
    }

    #[test]
    fn open_parent_uses_current_dir_for_bare_names() {
        let (_, name) = open_parent(Utf8Path::new("image.raw")).expect("open parent");
        assert_eq!(name, "image.raw");
    }

    #[test]
    fn open_parent_follows_parent_components() {
        let cwd = std::env::current_dir().expect("current dir");
        let Some(cwd_name) = cwd.file_name().and_then(|name| name.to_str()) else {
            return;
        };

        let (parent, name) = open_parent(Utf8Path::new("../image.raw")).expect("open parent");
        assert_eq!(name, "image.raw");
        assert!(parent.is_dir(cwd_name), "{cwd_name} not found in ..");
    }
}
