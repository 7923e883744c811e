//! Path utilities shared by every backend.
//!
//! All functions are pure string operations: nothing here touches the
//! filesystem. Separators are normalized to `/` so the same path string means
//! the same thing on local disk and in an object store.
//!
//! `..` segments that climb above the start of a path are kept literally
//! (`../../x` stays `../../x`, `/../x` stays `/../x`). Adapters decide what
//! an escaping path means for them.

/// Characters rejected by [`validate_path`].
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Device names reserved on Windows, rejected regardless of extension.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Result of [`validate_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValidation {
    pub is_valid: bool,
    pub error: Option<String>,
}

impl PathValidation {
    fn ok() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error: Some(error.into()),
        }
    }
}

/// Split off a leading drive letter such as `C:`.
fn split_drive(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        path.split_at(2)
    } else {
        ("", path)
    }
}

/// Normalize a path lexically.
///
/// Converts `\` to `/`, collapses repeated separators, resolves `.` and `..`,
/// keeps a drive letter, and drops any trailing separator.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let (drive, rest) = split_drive(&unified);
    let absolute = rest.starts_with('/');

    let mut stack: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => match stack.last() {
                Some(&last) if last != ".." => {
                    stack.pop();
                }
                _ => stack.push(".."),
            },
            name => stack.push(name),
        }
    }

    let body = stack.join("/");
    match (absolute, body.is_empty()) {
        (true, true) => format!("{}/", drive),
        (true, false) => format!("{}/{}", drive, body),
        (false, true) if drive.is_empty() => ".".to_string(),
        (false, true) => drive.to_string(),
        (false, false) => format!("{}{}", drive, body),
    }
}

/// Join segments with `/` and normalize the result.
pub fn join_path(segments: &[&str]) -> String {
    let joined = segments
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return ".".to_string();
    }
    normalize_path(&joined)
}

/// Whether the path is absolute (`/x`, `\x`, or `C:/x`).
pub fn is_absolute(path: &str) -> bool {
    let unified = path.replace('\\', "/");
    let (_, rest) = split_drive(&unified);
    rest.starts_with('/')
}

/// Parent directory of a path.
pub fn dirname(path: &str) -> String {
    let normalized = normalize_path(path);
    let (drive, rest) = split_drive(&normalized);
    if rest == "/" {
        return normalized;
    }
    match rest.rfind('/') {
        Some(0) => format!("{}/", drive),
        Some(idx) => format!("{}{}", drive, &rest[..idx]),
        None if drive.is_empty() => ".".to_string(),
        None => drive.to_string(),
    }
}

/// Last segment of a path, with `ext` removed when it matches.
pub fn basename(path: &str, ext: Option<&str>) -> String {
    let normalized = normalize_path(path);
    let (_, rest) = split_drive(&normalized);
    let name = rest.rsplit('/').next().unwrap_or("");
    match ext {
        Some(ext) if !ext.is_empty() && name.len() > ext.len() && name.ends_with(ext) => {
            name[..name.len() - ext.len()].to_string()
        }
        _ => name.to_string(),
    }
}

/// Extension of the last segment including the dot, or `""`.
///
/// Dotfiles such as `.bashrc` have no extension.
pub fn extname(path: &str) -> String {
    let name = basename(path, None);
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => name[idx..].to_string(),
    }
}

/// Resolve segments right to left until an absolute path is formed.
///
/// Without an absolute segment the result is anchored at the virtual root `/`.
pub fn resolve_path(segments: &[&str]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in segments.iter().rev() {
        if segment.is_empty() {
            continue;
        }
        parts.push(segment);
        if is_absolute(segment) {
            break;
        }
    }
    parts.reverse();
    let joined = parts.join("/");
    if is_absolute(&joined) {
        normalize_path(&joined)
    } else {
        normalize_path(&format!("/{}", joined))
    }
}

/// Relative path from `from` to `to`.
pub fn relative_path(from: &str, to: &str) -> String {
    let from = resolve_path(&[from]);
    let to = resolve_path(&[to]);
    if from == to {
        return String::new();
    }

    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result: Vec<&str> = vec![".."; from_parts.len() - common];
    result.extend(&to_parts[common..]);
    result.join("/")
}

/// Check a path for characters and names that are unsafe on common platforms.
pub fn validate_path(path: &str) -> PathValidation {
    if path.is_empty() {
        return PathValidation::invalid("path must not be empty");
    }
    if path.contains('\0') {
        return PathValidation::invalid("path contains a null byte");
    }

    let unified = path.replace('\\', "/");
    let (_, rest) = split_drive(&unified);
    if let Some(c) = rest.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return PathValidation::invalid(format!("path contains reserved character '{}'", c));
    }

    for segment in rest.split('/') {
        let stem = segment.split('.').next().unwrap_or("");
        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
            return PathValidation::invalid(format!("path uses reserved name '{}'", segment));
        }
    }

    PathValidation::ok()
}
