//! Char-indexed prefix tree with payloads on interior nodes.
//!
//! The tree backs longest-prefix URL routing: route paths are inserted with
//! a payload, and lookups walk the query string collecting the deepest
//! payload on the way. A single reader-writer lock at the root serializes
//! all access; writes are rare (route mutations) while reads are the request
//! hot path, so a reader lock suffices.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
struct Node<T> {
    children: HashMap<char, Node<T>>,
    payload: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            payload: None,
        }
    }
}

/// A clonable, thread-safe prefix tree.
#[derive(Debug)]
pub struct PrefixTree<T> {
    root: Arc<RwLock<Node<T>>>,
}

impl<T> Clone for PrefixTree<T> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
        }
    }
}

impl<T> Default for PrefixTree<T> {
    fn default() -> Self {
        Self {
            root: Arc::new(RwLock::new(Node::new())),
        }
    }
}

impl<T> PrefixTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` at the node spelled by `key`, overwriting any payload
    /// already there.
    pub fn add(&self, key: &str, value: T) {
        let mut root = self.root.write().expect("tree lock");
        let mut node = &mut *root;
        for ch in key.chars() {
            node = node.children.entry(ch).or_insert_with(Node::new);
        }
        node.payload = Some(value);
    }

    /// Clear the payload at `key` and prune branches left empty, bottom-up.
    pub fn remove(&self, key: &str) {
        let mut root = self.root.write().expect("tree lock");
        remove_rec(&mut root, key);
    }

    /// Walk `key` as far as edges match and return the deepest payload seen,
    /// together with the prefix of `key` consumed up to the node carrying
    /// that payload. Returns `(None, "")` when no node on the walk holds a
    /// payload.
    pub fn last_payload(&self, key: &str) -> (Option<T>, String)
    where
        T: Clone,
    {
        let root = self.root.read().expect("tree lock");

        let mut node = &*root;
        let mut best: Option<(T, usize)> = None;
        for (idx, ch) in key.char_indices() {
            match node.children.get(&ch) {
                Some(child) => node = child,
                None => break,
            }

            if let Some(payload) = &node.payload {
                best = Some((payload.clone(), idx + ch.len_utf8()));
            }
        }

        match best {
            Some((payload, end)) => (Some(payload), key[..end].to_string()),
            None => (None, String::new()),
        }
    }
}

fn remove_rec<T>(node: &mut Node<T>, key: &str) {
    let mut chars = key.chars();
    let Some(ch) = chars.next() else {
        node.payload = None;
        return;
    };

    let rest = chars.as_str();
    if let Some(child) = node.children.get_mut(&ch) {
        remove_rec(child, rest);
        if child.children.is_empty() && child.payload.is_none() {
            node.children.remove(&ch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup_returns_payload_and_full_key() {
        let tree = PrefixTree::new();
        tree.add("/hello", "x");

        let (payload, matched) = tree.last_payload("/hello");
        assert_eq!(payload, Some("x"));
        assert_eq!(matched, "/hello");
    }

    #[test]
    fn lookup_without_payload_is_absent() {
        let tree: PrefixTree<&str> = PrefixTree::new();
        tree.add("/hello", "x");

        let (payload, matched) = tree.last_payload("/other");
        assert_eq!(payload, None);
        assert_eq!(matched, "");
    }

    #[test]
    fn deepest_payload_wins() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.add("/a/b", "y");

        let (payload, matched) = tree.last_payload("/a/b/c");
        assert_eq!(payload, Some("y"));
        assert_eq!(matched, "/a/b");

        let (payload, matched) = tree.last_payload("/a/x");
        assert_eq!(payload, Some("x"));
        assert_eq!(matched, "/a");
    }

    #[test]
    fn matched_prefix_stops_at_payload_node_not_walk_depth() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.add("/abc", "y");

        // The walk consumes "/ab" before failing on 'd', but the payload sits
        // at "/a" so only "/a" is reported as matched.
        let (payload, matched) = tree.last_payload("/abd");
        assert_eq!(payload, Some("x"));
        assert_eq!(matched, "/a");
    }

    #[test]
    fn monotone_under_extension() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.add("/a/b", "y");

        let (base, _) = tree.last_payload("/a");
        assert_eq!(base, Some("x"));

        // Extending the input can only keep the payload or find a deeper one.
        for suffix in ["/", "/b", "/b/c", "zzz"] {
            let (payload, _) = tree.last_payload(&format!("/a{suffix}"));
            assert!(payload == Some("x") || payload == Some("y"));
        }
    }

    #[test]
    fn remove_clears_payload_and_preserves_deeper_routes() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.add("/a/b", "y");

        tree.remove("/a");
        let (payload, _) = tree.last_payload("/a");
        assert_eq!(payload, None);

        let (payload, matched) = tree.last_payload("/a/b");
        assert_eq!(payload, Some("y"));
        assert_eq!(matched, "/a/b");
    }

    #[test]
    fn remove_prunes_empty_branches() {
        let tree = PrefixTree::new();
        tree.add("/a/b", "y");
        tree.remove("/a/b");

        let root = tree.root.read().unwrap();
        assert!(root.children.is_empty());
    }

    #[test]
    fn remove_of_missing_key_is_a_noop() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.remove("/zzz");

        let (payload, _) = tree.last_payload("/a");
        assert_eq!(payload, Some("x"));
    }

    #[test]
    fn overwrite_replaces_payload() {
        let tree = PrefixTree::new();
        tree.add("/a", "x");
        tree.add("/a", "z");

        let (payload, _) = tree.last_payload("/a");
        assert_eq!(payload, Some("z"));
    }
}
