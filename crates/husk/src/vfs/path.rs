//! Path normalization for the virtual filesystem.

/// Resolve `path` against `cwd` into normalized segments.
///
/// Absolute paths ignore `cwd`. `.` segments and empty segments are dropped,
/// `..` pops the previous segment and is a no-op at the root. An empty path
/// resolves to `cwd` itself.
pub fn resolve(cwd: &str, path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    if !path.starts_with('/') {
        push_segments(&mut segments, cwd);
    }
    push_segments(&mut segments, path);
    segments
}

/// Render normalized segments as an absolute path string.
pub fn to_path(segments: &[String]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Normalize `path` against `cwd` and return it as an absolute path string.
pub fn normalize(cwd: &str, path: &str) -> String {
    to_path(&resolve(cwd, path))
}

fn push_segments(segments: &mut Vec<String>, path: &str) {
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name.to_string()),
        }
    }
}
