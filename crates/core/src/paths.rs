use std::path::{Component, Path, PathBuf};

/// Identity of a file path for ownership and producer lookups.
///
/// Two declared paths with the same key refer to the same artifact as far as
/// the engine is concerned, even if they alias through `..`, a symlinked
/// directory, or a difference in letter case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(root: &Path, path: &Path) -> Self {
        let joined = root.join(path);
        let absolute = normalize(&std::path::absolute(&joined).unwrap_or(joined));
        let resolved = resolve_parent_links(&absolute);
        Self(resolved.to_string_lossy().to_ascii_lowercase())
    }

    /// True when the keys are equal or one lies inside the other
    pub fn overlaps(&self, other: &PathKey) -> bool {
        let (a, b) = (Path::new(&self.0), Path::new(&other.0));
        a.starts_with(b) || b.starts_with(a)
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexically fold `.` and `..` components without touching the file system.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor so symlinked directories collapse.
fn resolve_parent_links(path: &Path) -> PathBuf {
    let mut tail = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                current = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}
