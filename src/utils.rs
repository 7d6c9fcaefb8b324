// Path and name helpers shared by the clients, the cache and the CLI.

pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

pub fn join_path(parent: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", parent, name))
}

pub fn parent_path(path: &str) -> String {
    let path = normalize_path(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

pub fn file_name(path: &str) -> String {
    let path = normalize_path(path);
    path.rsplit('/').next().unwrap_or("").to_string()
}

pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = normalize_path(path);
    let ancestor = normalize_path(ancestor);
    ancestor == "/" || path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

pub fn glob_match(filename: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(ext) = pattern.strip_prefix("*.") {
        filename.ends_with(&format!(".{}", ext))
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        filename.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        filename.ends_with(suffix)
    } else {
        filename == pattern
    }
}
