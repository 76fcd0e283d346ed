use rand::Rng;

/// The implicit root directory. Never stored as a path-map row.
pub const ROOT_DIR: &str = "/";

/// Join a parent path and a filename with a single separator.
///
/// The parent key convention keeps every stored parent path ending in `/`,
/// so joining a directory row's `(parent_path, filename)` reproduces the
/// prefix key its children are listed under.
pub fn normalize(parent: &str, filename: &str) -> String {
    let mut out = String::with_capacity(parent.len() + filename.len() + 1);
    out.push_str(parent);
    if !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(filename.trim_start_matches('/'));
    out
}

/// Everything up to and including the last `/` before the final component.
/// `/` for top-level entries, `None` for the root or a relative path.
pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    Some(trimmed[..=idx].to_string())
}

/// The final path component. Directory paths keep their trailing `/`.
/// `None` for the root or a relative path.
pub fn filename(path: &str) -> Option<String> {
    if path == ROOT_DIR {
        return None;
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    Some(path[idx + 1..].to_string())
}

/// Ensure a trailing `/`, yielding the prefix key children are listed under.
pub fn normalize_parent_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Stable `(filesystem, path)` joining used as the reverse-map set element.
pub fn marshal(filesystem: &str, path: &str) -> String {
    format!("{}:{}", filesystem, path)
}

/// Split a marshalled reverse-map element back into `(filesystem, path)`.
pub fn unmarshal(marshalled: &str) -> Option<(&str, &str)> {
    marshalled.split_once(':')
}

/// Build the ancestor-directory entries of a path, from the immediate
/// parent up to (but not including) the root.
///
/// `parent_path` is the entry's parent key (trailing `/`); the factory
/// receives `(filesystem, parent_path, filename)` per ancestor.
pub fn parents_bottom_up<T>(
    filesystem: &str,
    parent_path_key: &str,
    mut factory: impl FnMut(&str, &str, &str) -> T,
) -> Vec<T> {
    let mut out = Vec::new();
    let mut cur = parent_path_key.to_string();
    while cur != ROOT_DIR {
        let (Some(parent), Some(name)) = (parent_path(&cur), filename(&cur)) else {
            break;
        };
        out.push(factory(filesystem, &parent, &name));
        cur = parent;
    }
    out
}

const FILE_ID_LEN: usize = 32;

/// Opaque blob identifier. The first 4 characters drive the physical
/// store's two-level shard prefix.
pub fn random_file_id() -> String {
    let mut rng = rand::thread_rng();
    let id = format!("{:032x}", rng.gen::<u128>());
    debug_assert_eq!(id.len(), FILE_ID_LEN);
    id
}
