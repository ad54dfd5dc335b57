//! Longest-prefix path matching under a single domain.
//!
//! Paths are keyed by their `/`-separated segments. A route path is always
//! normalized to end with `/`, so every inserted segment is a directory. A
//! request segment only descends into a child when it is itself followed by
//! a `/`: `/foo` does not match the `/foo/` route but `/foo/x` does.

use std::collections::HashMap;

/// Segment tree mapping normalized paths to values.
#[derive(Debug)]
pub struct PathTree<T> {
    root: Node<T>,
    len: usize,
}

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    children: HashMap<String, Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate the directory segments of `path`: every segment followed by `/`.
fn dir_segments(path: &str) -> impl Iterator<Item = &str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let dirs = rest.rfind('/').map(|idx| &rest[..idx]);
    dirs.into_iter().flat_map(|dirs| dirs.split('/'))
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Attach `value` at `path`, returning any value it replaces.
    pub fn insert(&mut self, path: &str, value: T) -> Option<T> {
        let mut node = &mut self.root;
        for segment in dir_segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Value of the nearest ancestor of `path` that has one.
    pub fn lookup(&self, path: &str) -> Option<&T> {
        let mut node = &self.root;
        let mut best = node.value.as_ref();
        for segment in dir_segments(path) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if let Some(value) = &node.value {
                        best = Some(value);
                    }
                }
                None => break,
            }
        }
        best
    }

    /// Value attached exactly at `path`.
    pub fn get(&self, path: &str) -> Option<&T> {
        let mut node = &self.root;
        for segment in dir_segments(path) {
            node = node.children.get(segment)?;
        }
        node.value.as_ref()
    }

    /// Detach the value at `path`, pruning ancestors left empty.
    pub fn remove(&mut self, path: &str) -> Option<T> {
        let removed = remove_at(&mut self.root, dir_segments(path));
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }
}

fn remove_at<'a, T>(node: &mut Node<T>, mut segments: impl Iterator<Item = &'a str>) -> Option<T> {
    let Some(segment) = segments.next() else {
        return node.value.take();
    };
    let child = node.children.get_mut(segment)?;
    let removed = remove_at(child, segments);
    if removed.is_some() && child.value.is_none() && child.children.is_empty() {
        node.children.remove(segment);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tree() -> PathTree<&'static str> {
        let mut tree = PathTree::new();
        tree.insert("/", "root");
        tree.insert("/foo/", "foo");
        tree.insert("/foo/bar/", "bar");
        tree
    }

    #[test]
    fn test_dir_segments() {
        assert_eq!(dir_segments("/").count(), 0);
        assert_eq!(dir_segments("/foo").count(), 0);
        assert_eq!(dir_segments("/foo/").collect::<Vec<_>>(), vec!["foo"]);
        assert_eq!(
            dir_segments("/foo/bar/baz").collect::<Vec<_>>(),
            vec!["foo", "bar"]
        );
        assert_eq!(dir_segments("/a//b/").collect::<Vec<_>>(), vec!["a", "", "b"]);
    }

    #[rstest]
    #[case("/foo/bar/baz", Some("bar"))]
    #[case("/foo/bar/", Some("bar"))]
    #[case("/foo/other", Some("foo"))]
    #[case("/foo", Some("root"))]
    #[case("/anything-else", Some("root"))]
    #[case("/", Some("root"))]
    fn test_lookup(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(tree().lookup(path).copied(), expected);
    }

    #[test]
    fn test_lookup_without_root() {
        let mut tree = PathTree::new();
        tree.insert("/api/", 1);
        assert_eq!(tree.lookup("/api/v1"), Some(&1));
        assert_eq!(tree.lookup("/web/"), None);
    }

    #[test]
    fn test_insert_replaces() {
        let mut tree = tree();
        assert_eq!(tree.insert("/foo/", "foo2"), Some("foo"));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get("/foo/"), Some(&"foo2"));
    }

    #[test]
    fn test_remove_unwinds_empty_ancestors() {
        let mut tree = PathTree::new();
        tree.insert("/", 0);
        tree.insert("/a/b/c/", 1);
        assert_eq!(tree.root.children.len(), 1);

        assert_eq!(tree.remove("/a/b/c/"), Some(1));
        assert!(tree.root.children.is_empty());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.lookup("/a/b/c/d"), Some(&0));
    }

    #[test]
    fn test_remove_keeps_ancestors_with_routes_or_siblings() {
        let mut tree = PathTree::new();
        tree.insert("/a/", 1);
        tree.insert("/a/b/", 2);
        tree.insert("/a/c/x/", 3);

        assert_eq!(tree.remove("/a/c/x/"), Some(3));
        let a = &tree.root.children["a"];
        assert!(a.children.contains_key("b"));
        assert!(!a.children.contains_key("c"));

        assert_eq!(tree.remove("/a/"), Some(1));
        assert_eq!(tree.lookup("/a/b/z"), Some(&2));
        assert_eq!(tree.remove("/missing/"), None);

        assert_eq!(tree.remove("/a/b/"), Some(2));
        assert!(tree.is_empty());
        assert!(tree.root.children.is_empty());
    }
}
