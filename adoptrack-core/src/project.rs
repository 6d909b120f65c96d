//! Path-to-project resolution
//!
//! The engine buckets every metric under a project key derived from the
//! file path. Resolution is a collaborator: callers can plug in anything
//! that implements [`ProjectResolver`], including a plain closure.

use std::path::{Component, Path, PathBuf};

/// Maps a file key to the project it belongs to.
pub trait ProjectResolver: Send + Sync {
    fn resolve(&self, file_path: &str) -> String;
}

impl<F> ProjectResolver for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn resolve(&self, file_path: &str) -> String {
        self(file_path)
    }
}

/// Resolves projects from a list of known roots.
///
/// A file belongs to the longest configured root that is a component-wise
/// prefix of its path. Files outside every root fall back to their parent
/// directory. Resolution is purely lexical; the filesystem is never touched.
#[derive(Debug, Clone, Default)]
pub struct RootPrefixResolver {
    roots: Vec<PathBuf>,
}

impl RootPrefixResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let mut roots: Vec<PathBuf> = roots.into_iter().map(|r| normalize(&r)).collect();
        // Longest first so the first hit is the most specific root
        roots.sort_by_key(|r| std::cmp::Reverse(r.components().count()));
        Self { roots }
    }
}

impl ProjectResolver for RootPrefixResolver {
    fn resolve(&self, file_path: &str) -> String {
        let path = normalize(Path::new(file_path));

        if let Some(root) = self.roots.iter().find(|root| path.starts_with(root)) {
            return root.to_string_lossy().to_string();
        }

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().to_string(),
            _ => path.to_string_lossy().to_string(),
        }
    }
}

/// Drop `.` components and trailing separators without consulting the disk.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
