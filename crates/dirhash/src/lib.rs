//! # dirhash
//!
//! Content hashing for drift detection of filesystem-backed resources.
//!
//! A directory hash covers the *file set* of a tree: every regular file's
//! relative path and BLAKE3 content hash. Modification times, permissions and
//! traversal order do not contribute, so touching a file or copying the tree
//! elsewhere leaves the hash unchanged while editing, adding, removing or
//! renaming a file changes it.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! let before = dirhash::hash_dir(Path::new("./build-context"))?;
//! // ... files change ...
//! let after = dirhash::hash_dir(Path::new("./build-context"))?;
//! if before != after {
//!     println!("context drifted");
//! }
//! # Ok::<(), dirhash::Error>(())
//! ```

mod error;

pub use error::{Error, Result};

use blake3::Hasher;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Prefix identifying the hash algorithm in checksum strings
pub const PREFIX: &str = "b3:";

/// Relative path (always `/`-separated) to content hash
pub type FileTree = BTreeMap<String, String>;

/// Hash a single file's content
pub fn hash_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }

    let hex = hash_reader(path).map_err(|source| Error::HashFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(format!("{PREFIX}{hex}"))
}

/// Hash a directory tree, independent of traversal order and mtimes
pub fn hash_dir(path: &Path) -> Result<String> {
    let tree = file_tree(path)?;
    Ok(hash_tree(&tree))
}

/// Hash either a file or a directory
pub fn hash_path(path: &Path) -> Result<String> {
    if path.is_dir() {
        hash_dir(path)
    } else {
        hash_file(path)
    }
}

/// Collect the file set of a directory tree
///
/// Symlinks are not followed; a link contributes its target path instead of
/// the content it points at.
pub fn file_tree(root: &Path) -> Result<FileTree> {
    if !root.exists() {
        return Err(Error::PathNotFound(root.to_path_buf()));
    }

    let mut tree = FileTree::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let relative = relative_key(root, entry.path());

        let hash = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut hasher = Hasher::new();
            hasher.update(b"link:");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.finalize().to_hex().to_string()
        } else {
            hash_reader(entry.path()).map_err(|source| Error::HashFailed {
                path: entry.path().to_path_buf(),
                source,
            })?
        };

        tree.insert(relative, hash);
    }

    Ok(tree)
}

/// Combine a file tree into a single checksum
///
/// Each entry becomes a `"<hash>  <path>\n"` manifest line; the sorted
/// manifest is hashed again.
pub fn hash_tree(tree: &FileTree) -> String {
    let mut hasher = Hasher::new();
    for (path, hash) in tree {
        hasher.update(hash.as_bytes());
        hasher.update(b"  ");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    format!("{PREFIX}{}", hasher.finalize().to_hex())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn hash_reader(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Hasher::new();

    let mut buffer = [0u8; 65536];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
