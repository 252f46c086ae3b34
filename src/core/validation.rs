//! Validation for entry names and image paths
//!
//! Entry names are single path components: the namespace composes hierarchy
//! from them by string concatenation, so a name must never contain the
//! separator or be one of the navigation tokens.

use crate::error::{Result, VolumeError};
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Maximum length of an entry name in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a resolved directory path in bytes
pub const MAX_PATH_LEN: usize = 1023;

/// Extension every volume image file carries
pub const IMAGE_EXTENSION: &str = "img";

/// A validated entry name
///
/// # Rules
/// - 1 to 255 bytes
/// - No `/` and no NUL
/// - Not `.` or `..`
///
/// # Examples
///
/// ```
/// use volstore::validation::EntryName;
///
/// assert!(EntryName::new("notes.txt").is_ok());
/// assert!(EntryName::new("a/b").is_err());
/// assert!(EntryName::new("..").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryName(String);

impl EntryName {
    /// Pattern for a single path component
    const PATTERN: &'static str = r"^[^/\x00]+$";

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(EntryName(name))
    }

    fn pattern() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(Self::PATTERN).expect("entry name pattern is valid"))
    }

    fn validate(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VolumeError::InvalidName("name cannot be empty".to_string()));
        }

        if name.len() > MAX_NAME_LEN {
            return Err(VolumeError::InvalidName(format!(
                "name too long ({} bytes, max {})",
                name.len(),
                MAX_NAME_LEN
            )));
        }

        if name == "." || name == ".." {
            return Err(VolumeError::InvalidName(format!(
                "'{}' is reserved for navigation",
                name
            )));
        }

        if !Self::pattern().is_match(name) {
            return Err(VolumeError::InvalidName(format!(
                "'{}' must not contain '/' or NUL",
                name.escape_default()
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize an image file path
///
/// Appends `.img` when the path does not already end with it, the same
/// correction the shell applies when saving on exit.
///
/// # Examples
///
/// ```
/// use volstore::validation::normalize_image_path;
/// use std::path::Path;
///
/// assert_eq!(normalize_image_path(Path::new("disk")), Path::new("disk.img"));
/// assert_eq!(normalize_image_path(Path::new("disk.img")), Path::new("disk.img"));
/// assert_eq!(normalize_image_path(Path::new("disk.bak")), Path::new("disk.bak.img"));
/// ```
pub fn normalize_image_path(path: &Path) -> PathBuf {
    if has_image_extension(path) {
        return path.to_path_buf();
    }

    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(IMAGE_EXTENSION);
    PathBuf::from(name)
}

/// Whether a path names a volume image file
pub fn has_image_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(IMAGE_EXTENSION)
}
