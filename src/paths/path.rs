use crate::error::DocGraphError;
use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};
use unicode_normalization::UnicodeNormalization;

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    let res = os_path_ref
        .as_ref()
        .components()
        .map(|c| match c {
            Component::RootDir => Cow::from("".to_string()),
            _ => c.as_os_str().to_string_lossy(),
        })
        .collect::<Vec<_>>()
        .join("/");
    tracing::trace!(
        "os_path_to_string: turned {:?} into {}",
        os_path_ref.as_ref().components(),
        res
    );
    res
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.replace('/', MAIN_SEPARATOR_STR))
}

/// An extension is 1-4 ascii alphanumerics with at least one letter, so `v1.2` or `draft.2024`
/// keep their numeric suffix as part of the name.
pub fn is_extension(candidate: &str) -> bool {
    (1..=4).contains(&candidate.len())
        && candidate.chars().all(|c| c.is_ascii_alphanumeric())
        && candidate.chars().any(|c| c.is_ascii_alphabetic())
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// The extension of the last path segment, if it has one. Hidden files (`.env`) have none.
pub fn extension_of(path: &str) -> Option<&str> {
    let name = file_name(path);
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    let ext = &name[dot + 1..];
    is_extension(ext).then_some(ext)
}

pub fn strip_extension(path: &str) -> &str {
    match extension_of(path) {
        Some(ext) => &path[..path.len() - ext.len() - 1],
        None => path,
    }
}

/// File name without directories or extension: `notes/My Note.md` -> `My Note`.
pub fn base_name(path: &str) -> &str {
    strip_extension(file_name(path))
}

/// Case-folded, NFC-composed, forward-slash form of a root-relative path. Empty and `.`
/// segments are dropped, as is any leading separator.
pub fn canonical_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let folded = unified.nfc().collect::<String>().to_lowercase();
    folded
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical form of a link target: [`canonical_path`] plus `default_ext` when the target has no
/// extension of its own.
pub fn canonical_link_target(target: &str, default_ext: &str) -> String {
    let canonical = canonical_path(target);
    if extension_of(&canonical).is_some() {
        canonical
    } else {
        format!("{canonical}.{}", default_ext.to_lowercase())
    }
}

/// `path` relative to `root`, forward-slash separated, original case preserved.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, DocGraphError> {
    let relative = path.strip_prefix(root)?;
    Ok(os_path_to_string(relative))
}

/// Join a caller-supplied location onto `root`, rejecting anything that would land outside it.
pub fn resolve_in_root(root: &Path, location: &str) -> Result<PathBuf, DocGraphError> {
    let candidate = string_to_os_path(location);
    let candidate = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| DocGraphError::OutsideRoot(location.to_string()))?
            .to_path_buf()
    } else {
        candidate
    };

    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(segment) => clean.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(DocGraphError::OutsideRoot(location.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DocGraphError::OutsideRoot(location.to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(DocGraphError::OutsideRoot(location.to_string()));
    }
    Ok(root.join(clean))
}
