//! In-memory hierarchical filesystem with a session-wide working directory.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::path;
use crate::clock::unix_millis;

const FILE_PERMISSIONS: &str = "-rw-r--r--";
const DIR_PERMISSIONS: &str = "drwxr-xr-x";

/// Directories created by [`VirtualFileSystem::new`].
const DEFAULT_LAYOUT: &[&str] = &["/bin", "/etc", "/home", "/home/user", "/tmp", "/usr", "/var"];

/// Initial working directory of [`VirtualFileSystem::new`].
const DEFAULT_HOME: &str = "/home/user";

/// Errors that can occur during filesystem operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    /// A directory was missing, or the path was not a directory
    #[error("{operation}: {path}: {message}")]
    Directory {
        /// Operation that failed (e.g. `cd`, `mkdir`)
        operation: &'static str,
        /// Path as given by the caller
        path: String,
        /// Human-readable reason
        message: String,
    },
    /// A file was missing, or the path was not a file
    #[error("{operation}: {path}: {message}")]
    File {
        /// Operation that failed (e.g. `read`, `rm`)
        operation: &'static str,
        /// Path as given by the caller
        path: String,
        /// Human-readable reason
        message: String,
    },
}

impl VfsError {
    fn directory(operation: &'static str, path: &str, message: &str) -> Self {
        Self::Directory {
            operation,
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    fn file(operation: &'static str, path: &str, message: &str) -> Self {
        Self::File {
            operation,
            path: path.to_string(),
            message: message.to_string(),
        }
    }
}

/// Whether a node is a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// One entry of a detailed directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// File or directory
    pub kind: NodeKind,
    /// Display permissions, e.g. `-rw-r--r--`
    pub permissions: String,
    /// File length, or recursive sum of file lengths for directories
    pub size: u64,
    /// Last modified time as Unix milliseconds
    pub modified: u64,
}

#[derive(Debug, Clone)]
enum Node {
    File {
        content: String,
        permissions: String,
        modified: u64,
    },
    Directory {
        children: BTreeMap<String, Node>,
        permissions: String,
        modified: u64,
    },
}

impl Node {
    fn file(content: String) -> Self {
        Node::File {
            content,
            permissions: FILE_PERMISSIONS.to_string(),
            modified: unix_millis(),
        }
    }

    fn directory() -> Self {
        Node::Directory {
            children: BTreeMap::new(),
            permissions: DIR_PERMISSIONS.to_string(),
            modified: unix_millis(),
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Node::File { .. } => NodeKind::File,
            Node::Directory { .. } => NodeKind::Directory,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self, Node::Directory { .. })
    }

    fn size(&self) -> u64 {
        match self {
            Node::File { content, .. } => content.len() as u64,
            Node::Directory { children, .. } => children.values().map(Node::size).sum(),
        }
    }

    fn entry(&self, name: &str) -> DirEntry {
        let (permissions, modified) = match self {
            Node::File {
                permissions,
                modified,
                ..
            }
            | Node::Directory {
                permissions,
                modified,
                ..
            } => (permissions.clone(), *modified),
        };
        DirEntry {
            name: name.to_string(),
            kind: self.kind(),
            permissions,
            size: self.size(),
            modified,
        }
    }

    fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Directory { children, .. } => Some(children),
            Node::File { .. } => None,
        }
    }

    /// Children of a directory, bumping its modification time.
    fn children_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match self {
            Node::Directory {
                children, modified, ..
            } => {
                *modified = unix_millis();
                Some(children)
            }
            Node::File { .. } => None,
        }
    }
}

fn lookup<'a>(root: &'a Node, segments: &[String]) -> Option<&'a Node> {
    segments
        .iter()
        .try_fold(root, |node, name| node.children()?.get(name))
}

fn lookup_mut<'a>(root: &'a mut Node, segments: &[String]) -> Option<&'a mut Node> {
    let mut node = root;
    for name in segments {
        node = match node {
            Node::Directory { children, .. } => children.get_mut(name)?,
            Node::File { .. } => return None,
        };
    }
    Some(node)
}

#[derive(Debug)]
struct FsState {
    root: Node,
    cwd: String,
}

impl FsState {
    fn resolve(&self, path: &str) -> Vec<String> {
        path::resolve(&self.cwd, path)
    }
}

/// In-memory filesystem backing all shell I/O.
///
/// Paths follow Unix rules: a leading `/` is absolute, anything else is
/// resolved against the current directory. `.` is dropped and `..` pops one
/// level (staying at `/` when already there).
///
/// The current directory is shared by every caller holding this filesystem,
/// just like a shell session has one `cwd`.
#[derive(Debug)]
pub struct VirtualFileSystem {
    state: RwLock<FsState>,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    /// Create a filesystem with a conventional layout and `cwd` at `/home/user`.
    pub fn new() -> Self {
        let fs = Self::empty();
        for dir in DEFAULT_LAYOUT {
            if let Err(e) = fs.create_directory(dir) {
                tracing::warn!("Failed to create default directory {}: {}", dir, e);
            }
        }
        if let Err(e) = fs.change_directory(DEFAULT_HOME) {
            tracing::warn!("Failed to enter {}: {}", DEFAULT_HOME, e);
        }
        fs
    }

    /// Create a filesystem containing only `/`.
    pub fn empty() -> Self {
        Self {
            state: RwLock::new(FsState {
                root: Node::directory(),
                cwd: "/".to_string(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FsState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FsState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Absolute path of the current directory.
    pub fn current_directory(&self) -> String {
        self.read().cwd.clone()
    }

    /// Change the current directory.
    pub fn change_directory(&self, path: &str) -> Result<(), VfsError> {
        let mut state = self.write();
        let segments = state.resolve(path);
        match lookup(&state.root, &segments).map(Node::is_dir) {
            Some(true) => {
                state.cwd = path::to_path(&segments);
                Ok(())
            }
            Some(false) => Err(VfsError::directory("cd", path, "Not a directory")),
            None => Err(VfsError::directory("cd", path, "No such file or directory")),
        }
    }

    /// Names of the entries in a directory, sorted.
    pub fn list_directory(&self, path: &str) -> Result<Vec<String>, VfsError> {
        let state = self.read();
        let children = Self::dir_children(&state, "ls", path)?;
        Ok(children.keys().cloned().collect())
    }

    /// Metadata for every entry in a directory, sorted by name.
    pub fn detailed_listing(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        let state = self.read();
        let children = Self::dir_children(&state, "ls", path)?;
        Ok(children
            .iter()
            .map(|(name, node)| node.entry(name))
            .collect())
    }

    fn dir_children<'a>(
        state: &'a FsState,
        operation: &'static str,
        path: &str,
    ) -> Result<&'a BTreeMap<String, Node>, VfsError> {
        match lookup(&state.root, &state.resolve(path)) {
            Some(node) => node
                .children()
                .ok_or_else(|| VfsError::directory(operation, path, "Not a directory")),
            None => Err(VfsError::directory(
                operation,
                path,
                "No such file or directory",
            )),
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        let state = self.read();
        lookup(&state.root, &state.resolve(path)).is_some()
    }

    /// Whether `path` is a directory. False if it does not exist.
    pub fn is_directory(&self, path: &str) -> bool {
        let state = self.read();
        lookup(&state.root, &state.resolve(path)).is_some_and(Node::is_dir)
    }

    /// Whether `path` is a file. False if it does not exist.
    pub fn is_file(&self, path: &str) -> bool {
        let state = self.read();
        lookup(&state.root, &state.resolve(path)).is_some_and(|n| !n.is_dir())
    }

    /// Full content of a file.
    pub fn read_file(&self, path: &str) -> Result<String, VfsError> {
        let state = self.read();
        match lookup(&state.root, &state.resolve(path)) {
            Some(Node::File { content, .. }) => Ok(content.clone()),
            Some(Node::Directory { .. }) => Err(VfsError::file("read", path, "Is a directory")),
            None => Err(VfsError::file("read", path, "No such file or directory")),
        }
    }

    /// Create or overwrite a file. The parent directory must already exist.
    pub fn write_file(&self, path: &str, content: &str) -> Result<(), VfsError> {
        self.put_file("write", path, |_| content.to_string())
    }

    /// Append to a file, creating it if missing.
    pub fn append_file(&self, path: &str, content: &str) -> Result<(), VfsError> {
        self.put_file("append", path, |existing| {
            let mut data = existing.unwrap_or_default();
            data.push_str(content);
            data
        })
    }

    fn put_file(
        &self,
        operation: &'static str,
        path: &str,
        build: impl FnOnce(Option<String>) -> String,
    ) -> Result<(), VfsError> {
        let mut state = self.write();
        let mut segments = state.resolve(path);
        let Some(name) = segments.pop() else {
            return Err(VfsError::file(operation, path, "Is a directory"));
        };

        let Some(parent) = lookup_mut(&mut state.root, &segments) else {
            return Err(VfsError::directory(
                operation,
                path,
                "No such file or directory",
            ));
        };
        let Some(children) = parent.children_mut() else {
            return Err(VfsError::directory(operation, path, "Not a directory"));
        };

        let existing = match children.remove(&name) {
            Some(Node::File { content, .. }) => Some(content),
            Some(dir @ Node::Directory { .. }) => {
                children.insert(name, dir);
                return Err(VfsError::file(operation, path, "Is a directory"));
            }
            None => None,
        };
        children.insert(name, Node::file(build(existing)));
        Ok(())
    }

    /// Create a single directory. The parent must exist and the target must not.
    pub fn create_directory(&self, path: &str) -> Result<(), VfsError> {
        let mut state = self.write();
        let mut segments = state.resolve(path);
        let Some(name) = segments.pop() else {
            return Err(VfsError::directory("mkdir", path, "File exists"));
        };

        let Some(parent) = lookup_mut(&mut state.root, &segments) else {
            return Err(VfsError::directory(
                "mkdir",
                path,
                "No such file or directory",
            ));
        };
        let Some(children) = parent.children_mut() else {
            return Err(VfsError::directory("mkdir", path, "Not a directory"));
        };
        if children.contains_key(&name) {
            return Err(VfsError::directory("mkdir", path, "File exists"));
        }
        children.insert(name, Node::directory());
        Ok(())
    }

    /// Create a directory and any missing ancestors (`mkdir -p`).
    ///
    /// Existing directories along the way are fine; an existing file is not.
    pub fn create_directories(&self, path: &str) -> Result<(), VfsError> {
        let mut state = self.write();
        let segments = state.resolve(path);
        let mut node = &mut state.root;
        for name in segments {
            let Some(children) = node.children_mut() else {
                return Err(VfsError::directory("mkdir", path, "Not a directory"));
            };
            node = children.entry(name).or_insert_with(Node::directory);
        }
        if node.is_dir() {
            Ok(())
        } else {
            Err(VfsError::directory("mkdir", path, "Not a directory"))
        }
    }

    /// Remove a file or directory, including everything below it.
    ///
    /// Non-empty directories are removed without confirmation. If the current
    /// directory disappears with it, `cwd` moves to the removed node's parent.
    pub fn remove(&self, path: &str) -> Result<(), VfsError> {
        let mut state = self.write();
        let mut segments = state.resolve(path);
        let removed = path::to_path(&segments);
        let Some(name) = segments.pop() else {
            return Err(VfsError::directory("rm", path, "Cannot remove root directory"));
        };

        let children = lookup_mut(&mut state.root, &segments).and_then(Node::children_mut);
        if children.and_then(|c| c.remove(&name)).is_none() {
            return Err(VfsError::file("rm", path, "No such file or directory"));
        }

        if state.cwd == removed || state.cwd.starts_with(&format!("{}/", removed)) {
            state.cwd = path::to_path(&segments);
        }
        Ok(())
    }

    /// Size of a file, or the recursive sum of file sizes under a directory.
    pub fn size(&self, path: &str) -> Result<u64, VfsError> {
        let state = self.read();
        lookup(&state.root, &state.resolve(path))
            .map(Node::size)
            .ok_or_else(|| VfsError::file("stat", path, "No such file or directory"))
    }

    /// Metadata for a single path.
    pub fn metadata(&self, path: &str) -> Result<DirEntry, VfsError> {
        let state = self.read();
        let segments = state.resolve(path);
        let name = segments.last().map(String::as_str).unwrap_or("/");
        lookup(&state.root, &segments)
            .map(|node| node.entry(name))
            .ok_or_else(|| VfsError::file("stat", path, "No such file or directory"))
    }
}
