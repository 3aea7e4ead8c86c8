//! Read-only discovery over the sandbox module root.
//!
//! This is the only component that touches the raw filesystem for discovery.
//! Every path is checked lexically (no absolute paths, no `..`, no NUL) and
//! then canonically (symlinks must resolve inside the root) before any
//! directory is listed or any file is opened.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{GatewayError, Result};

/// Kind of a discovered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size_bytes: u64,
}

/// How file content is encoded in a [`Listing::File`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentEncoding {
    Utf8,
    Hex,
}

/// Response to a discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Listing {
    Directory {
        path: String,
        contents: Vec<DirEntryInfo>,
        size_bytes: u64,
    },
    File {
        path: String,
        content: String,
        encoding: ContentEncoding,
        size_bytes: u64,
    },
}

/// Discovery over a fixed sandbox root.
#[derive(Debug, Clone)]
pub struct ModuleIndex {
    root: PathBuf,
    max_read_bytes: u64,
}

impl ModuleIndex {
    /// Create an index rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, max_read_bytes: u64) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref())
            .map_err(|_| GatewayError::Config("module root does not exist".to_string()))?;
        if !root.is_dir() {
            return Err(GatewayError::Config(
                "module root is not a directory".to_string(),
            ));
        }
        Ok(Self {
            root,
            max_read_bytes,
        })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an existing sandbox-relative path to a canonical host path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        confine(&self.root, relative, true)
    }

    /// List a directory under the root.
    pub fn list(&self, relative: &str) -> Result<Listing> {
        let dir = self.resolve(relative)?;
        if !dir.is_dir() {
            return Err(GatewayError::NotFound(format!(
                "'{}' is not a directory",
                display_relative(relative)
            )));
        }

        let mut contents = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            // Symlinks pointing outside the root are invisible.
            let Ok(target) = fs::canonicalize(entry.path()) else {
                continue;
            };
            if !target.starts_with(&self.root) {
                continue;
            }
            let meta = fs::metadata(&target)?;
            contents.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size_bytes: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        contents.sort_by(|a, b| a.name.cmp(&b.name));

        let size_bytes = contents.iter().map(|e| e.size_bytes).sum();
        Ok(Listing::Directory {
            path: display_relative(relative),
            contents,
            size_bytes,
        })
    }

    /// Read a file under the root.
    pub fn read(&self, relative: &str) -> Result<Listing> {
        let (bytes, _) = self.read_bytes(relative)?;
        let size_bytes = bytes.len() as u64;
        let (content, encoding) = match String::from_utf8(bytes) {
            Ok(text) => (text, ContentEncoding::Utf8),
            Err(e) => (hex::encode(e.into_bytes()), ContentEncoding::Hex),
        };
        Ok(Listing::File {
            path: display_relative(relative),
            content,
            encoding,
            size_bytes,
        })
    }

    /// Read raw bytes and the modification time of a file under the root.
    pub(crate) fn read_bytes(&self, relative: &str) -> Result<(Vec<u8>, SystemTime)> {
        let path = self.resolve(relative)?;
        let meta = fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(GatewayError::NotFound(format!(
                "'{}' is not a file",
                display_relative(relative)
            )));
        }
        if meta.len() > self.max_read_bytes {
            return Err(GatewayError::ResourceExceeded(format!(
                "'{}' is {} bytes, read limit is {}",
                display_relative(relative),
                meta.len(),
                self.max_read_bytes
            )));
        }
        let bytes = fs::read(&path)?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok((bytes, modified))
    }
}

/// Render a discovery result as the wire response.
///
/// Errors become `{"error": "not found"}` or `{"error": "path escape"}`.
pub fn discovery_response(result: Result<Listing>) -> serde_json::Value {
    match result {
        Ok(listing) => serde_json::to_value(listing).unwrap_or_else(|_| json!({})),
        Err(GatewayError::NotFound(_)) => json!({ "error": "not found" }),
        Err(GatewayError::PathEscape(_)) => json!({ "error": "path escape" }),
        Err(other) => json!({ "error": other.message(), "error_kind": other.kind() }),
    }
}

/// Lexically validate a sandbox-relative path.
///
/// Rejects absolute paths, drive prefixes, `..` components and NUL bytes.
/// An empty path or `.` denotes the root.
pub fn normalize_relative(relative: &str) -> Result<PathBuf> {
    if relative.contains('\0') {
        return Err(GatewayError::PathEscape(
            "path contains a NUL byte".to_string(),
        ));
    }
    if relative.starts_with('/') || relative.starts_with('\\') {
        return Err(GatewayError::PathEscape(format!(
            "absolute path '{relative}' is not allowed"
        )));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(GatewayError::PathEscape(format!(
                    "'{relative}' contains a parent-directory reference"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::PathEscape(format!(
                    "absolute path '{relative}' is not allowed"
                )))
            }
        }
    }
    Ok(clean)
}

/// Confine `relative` to `root` (which must already be canonical).
///
/// With `must_exist`, the target is canonicalized and must stay inside the
/// root. Without it, the target may be missing but its parent must exist
/// inside the root; this is the form used for write targets.
pub(crate) fn confine(root: &Path, relative: &str, must_exist: bool) -> Result<PathBuf> {
    let clean = normalize_relative(relative)?;
    let joined = root.join(&clean);

    match fs::canonicalize(&joined) {
        Ok(canonical) => {
            if canonical.starts_with(root) {
                Ok(canonical)
            } else {
                Err(GatewayError::PathEscape(format!(
                    "'{}' resolves outside the sandbox root",
                    display_relative(relative)
                )))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Find the deepest existing ancestor so a symlinked parent that
            // leaves the root is reported as an escape, not as missing.
            let mut ancestor = joined.parent();
            while let Some(dir) = ancestor {
                if let Ok(canonical) = fs::canonicalize(dir) {
                    if !canonical.starts_with(root) {
                        return Err(GatewayError::PathEscape(format!(
                            "'{}' resolves outside the sandbox root",
                            display_relative(relative)
                        )));
                    }
                    if !must_exist && dir == joined.parent().unwrap_or(root) {
                        if let Some(name) = joined.file_name() {
                            return Ok(canonical.join(name));
                        }
                    }
                    break;
                }
                ancestor = dir.parent();
            }
            Err(GatewayError::NotFound(format!(
                "'{}' does not exist",
                display_relative(relative)
            )))
        }
        Err(e) => Err(GatewayError::Io(e)),
    }
}

fn display_relative(relative: &str) -> String {
    let trimmed = relative.trim_start_matches("./");
    if trimmed.is_empty() || trimmed == "." {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, ModuleIndex) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("episodic")).unwrap();
        fs::write(dir.path().join("episodic/search.wat"), "(module)").unwrap();
        fs::write(dir.path().join("README.md"), "# ops").unwrap();
        let index = ModuleIndex::new(dir.path(), 1024).unwrap();
        (dir, index)
    }

    #[test]
    fn test_list_root() {
        let (_dir, index) = fixture();
        let listing = index.list("").unwrap();
        match listing {
            Listing::Directory { contents, .. } => {
                let names: Vec<_> = contents.iter().map(|e| e.name.as_str()).collect();
                assert_eq!(names, vec!["README.md", "episodic"]);
                assert_eq!(contents[1].kind, EntryKind::Directory);
            }
            other => panic!("expected directory, got {other:?}"),
        }
    }

    #[test]
    fn test_read_file() {
        let (_dir, index) = fixture();
        match index.read("episodic/search.wat").unwrap() {
            Listing::File {
                content,
                encoding,
                size_bytes,
                ..
            } => {
                assert_eq!(content, "(module)");
                assert_eq!(encoding, ContentEncoding::Utf8);
                assert_eq!(size_bytes, 8);
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_is_hex_encoded() {
        let (dir, index) = fixture();
        fs::write(dir.path().join("blob.wasm"), [0x00, 0x61, 0x73, 0x6d, 0xff]).unwrap();
        match index.read("blob.wasm").unwrap() {
            Listing::File {
                content, encoding, ..
            } => {
                assert_eq!(encoding, ContentEncoding::Hex);
                assert_eq!(content, "0061736dff");
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, index) = fixture();
        assert!(matches!(
            index.read("../etc/passwd"),
            Err(GatewayError::PathEscape(_))
        ));
        assert!(matches!(
            index.list("episodic/../../"),
            Err(GatewayError::PathEscape(_))
        ));
    }

    #[test]
    fn test_absolute_path_rejected() {
        let (_dir, index) = fixture();
        assert!(matches!(
            index.read("/etc/passwd"),
            Err(GatewayError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, index) = fixture();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "s3cret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        assert!(matches!(
            index.read("link/secret.txt"),
            Err(GatewayError::PathEscape(_))
        ));
        assert!(matches!(
            index.read("link/missing.txt"),
            Err(GatewayError::PathEscape(_))
        ));
        // The escaping link is not listed either.
        if let Listing::Directory { contents, .. } = index.list(".").unwrap() {
            assert!(contents.iter().all(|e| e.name != "link"));
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, index) = fixture();
        assert!(matches!(
            index.read("episodic/nope.wat"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_limit() {
        let (dir, index) = fixture();
        fs::write(dir.path().join("big.txt"), vec![b'x'; 2048]).unwrap();
        assert!(matches!(
            index.read("big.txt"),
            Err(GatewayError::ResourceExceeded(_))
        ));
    }

    #[test]
    fn test_discovery_response_shapes() {
        let (_dir, index) = fixture();
        assert_eq!(
            discovery_response(index.read("nope")),
            json!({ "error": "not found" })
        );
        assert_eq!(
            discovery_response(index.read("../x")),
            json!({ "error": "path escape" })
        );
        let ok = discovery_response(index.read("README.md"));
        assert_eq!(ok["type"], "file");
        assert_eq!(ok["content"], "# ops");
    }

    #[test]
    fn test_confine_write_target() {
        let (dir, _index) = fixture();
        let root = fs::canonicalize(dir.path()).unwrap();
        let target = confine(&root, "episodic/new.json", false).unwrap();
        assert!(target.starts_with(&root));
        assert!(target.ends_with("episodic/new.json"));
        assert!(matches!(
            confine(&root, "missing_dir/new.json", false),
            Err(GatewayError::NotFound(_))
        ));
    }
}
