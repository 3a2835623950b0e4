pub mod logger;
pub mod memory;

/// Formats a byte count for status messages, e.g. `1.5 MB`.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value.round() as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Splits a `/`-separated relative path into its non-empty components.
pub fn path_components(rel: &str) -> Vec<&str> {
    rel.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

/// Parent of a `/`-separated relative path; `None` for top-level entries.
pub fn parent_of(rel: &str) -> Option<String> {
    let components = path_components(rel);
    if components.len() <= 1 {
        None
    } else {
        Some(components[..components.len() - 1].join("/"))
    }
}

/// Every ancestor of `rel` plus `rel` itself, shallowest first.
pub fn ancestors_inclusive(rel: &str) -> Vec<String> {
    let components = path_components(rel);
    (1..=components.len())
        .map(|n| components[..n].join("/"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.5 KB");
        assert_eq!(format_bytes(50.0 * 1024.0 * 1024.0), "50.0 MB");
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(path_components("/a//b/./c/"), vec!["a", "b", "c"]);
        assert_eq!(parent_of("a/b/f.txt").as_deref(), Some("a/b"));
        assert_eq!(parent_of("top.txt"), None);
        assert_eq!(ancestors_inclusive("a/b/c"), vec!["a", "a/b", "a/b/c"]);
    }
}
