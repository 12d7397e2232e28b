//! Path rewriting from matched front URI to upstream back URI

use crate::db::Mapping;

/// Rewrite a request path according to a mapping's front/back URIs.
///
/// Stored URIs carry no leading slash; they are normalized to `/`-prefixed
/// form here. The four shapes:
///
/// * both empty: path passes through untouched
/// * both set: the leading front prefix is replaced by the back prefix
/// * front only: the prefix is stripped (an empty remainder becomes `/`)
/// * back only: the back prefix is prepended
///
/// The result never contains `//` and always starts with `/`.
pub fn rewrite_path(path: &str, front_uri: &str, back_uri: &str) -> String {
    let front = prefixed(front_uri);
    let back = prefixed(back_uri);

    let mut result = match (front.is_empty(), back.is_empty()) {
        (true, true) => return path.to_string(),
        (false, false) => {
            if let Some(rest) = path.strip_prefix(&front) {
                format!("{back}{rest}")
            } else if let Some(rest) = path.strip_prefix(front.trim_start_matches('/')) {
                // Paths missing their leading slash still get rewritten.
                format!("{back}{rest}")
            } else {
                path.to_string()
            }
        }
        (false, true) => match path.strip_prefix(&front) {
            Some("") => "/".to_string(),
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        },
        (true, false) => format!("{back}{path}"),
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }
    if !result.starts_with('/') {
        result.insert(0, '/');
    }
    result
}

fn prefixed(uri: &str) -> String {
    if uri.is_empty() {
        String::new()
    } else if uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{uri}")
    }
}

/// Absolute upstream URL for a mapping and request path.
///
/// The host is loopback unless the mapping names an external backend
/// base; `back_port` applies either way. The query string is carried
/// byte-for-byte. When both URIs are empty the path bypasses the
/// rewriter entirely.
pub fn target_url(mapping: &Mapping, path: &str, query: Option<&str>) -> String {
    let base = mapping.backend.as_deref().unwrap_or("http://localhost");

    let target_path = if mapping.front_uri.is_empty() && mapping.back_uri.is_empty() {
        path.to_string()
    } else {
        rewrite_path(path, &mapping.front_uri, &mapping.back_uri)
    };

    match query {
        Some(q) => format!("{}:{}{}?{}", base, mapping.back_port, target_path, q),
        None => format!("{}:{}{}", base, mapping.back_port, target_path),
    }
}
