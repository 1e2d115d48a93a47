//! Working-directory normalization and proximity.
//!
//! Correlation by working directory is lexical: no filesystem access, no
//! symlink resolution. Hook scripts report `$PWD` verbatim, so both sides of
//! a comparison come from the same kind of source.

/// Normalizes a path lexically: collapses separators, drops `.` segments,
/// resolves `..` and strips any trailing slash.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let absolute = trimmed.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Last path component, used as the project name.
pub fn project_name(path: &str) -> String {
    normalize_path(path)
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Returns true if `child` equals `parent` or lies beneath it.
pub fn is_within(child: &str, parent: &str) -> bool {
    let child = normalize_path(child);
    let parent = normalize_path(parent);
    if child == parent {
        return true;
    }
    if parent == "/" {
        return child.starts_with('/');
    }
    child
        .strip_prefix(&parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Equal, nested under, or nested over: the proximity used to pair a
/// subagent session with the supervisor that spawned it.
pub fn paths_related(a: &str, b: &str) -> bool {
    is_within(a, b) || is_within(b, a)
}
