//! Watched-path prefix filter.
//!
//! Prefixes are matched whole path components at a time, so `/var/log`
//! covers `/var/log/syslog` but never `/var/logging/x`.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    terminal: bool,
    children: HashMap<String, Node>,
}

#[derive(Debug, Default)]
pub struct PathFilter {
    root: Node,
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an already-normalized absolute path. Inserting `/` makes the
    /// filter match every path.
    pub fn insert(&mut self, path: &str) {
        let mut node = &mut self.root;
        for comp in components(path) {
            node = node.children.entry(comp.to_string()).or_default();
        }
        node.terminal = true;
    }

    /// True when some inserted prefix covers `path` at a component boundary.
    pub fn matches(&self, path: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for comp in components(path) {
            match node.children.get(comp) {
                Some(child) => {
                    node = child;
                    if node.terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Lexically cleans a path: collapses separators, resolves `.` and `..`,
/// strips trailing slashes. `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            comp => parts.push(comp),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(paths: &[&str]) -> PathFilter {
        let mut f = PathFilter::new();
        for p in paths {
            f.insert(p);
        }
        f
    }

    #[test]
    fn matches_at_component_boundaries_only() {
        let f = filter(&["/var/log"]);
        assert!(f.matches("/var/log"));
        assert!(f.matches("/var/log/syslog"));
        assert!(f.matches("/var/log/nested/deep/file"));
        assert!(!f.matches("/var/logging/x"));
        assert!(!f.matches("/var"));
        assert!(!f.matches("/etc/passwd"));
    }

    #[test]
    fn several_prefixes_are_independent() {
        let f = filter(&["/tmp/watched", "/srv/data"]);
        assert!(f.matches("/tmp/watched/sub/a.txt"));
        assert!(f.matches("/srv/data/x"));
        assert!(!f.matches("/tmp/other/a.txt"));
    }

    #[test]
    fn root_prefix_matches_everything() {
        let f = filter(&["/"]);
        assert!(f.matches("/etc"));
        assert!(f.matches("/anything/at/all"));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        assert!(!PathFilter::new().matches("/tmp/a"));
    }

    #[test]
    fn normalize_collapses_separators_and_dots() {
        assert_eq!(normalize("/var//log/"), "/var/log");
        assert_eq!(normalize("/var/./log"), "/var/log");
        assert_eq!(normalize("/var/log/../cache"), "/var/cache");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
        assert_eq!(normalize("/a/b/../../.."), "/");
    }
}
