//! Filter trie used by the subscription index
//!
//! Each level of a filter is one edge. `+` levels hang off a dedicated child
//! and a trailing `#` is stored on the node that precedes it, so matching a
//! topic walks at most three edges per level.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

struct Node<V> {
    /// Value for a filter ending at this node
    exact: Option<V>,
    /// Value for `<path>/#`
    multi: Option<V>,
    children: AHashMap<CompactString, Node<V>>,
    plus: Option<Box<Node<V>>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            exact: None,
            multi: None,
            children: AHashMap::new(),
            plus: None,
        }
    }
}

impl<V> Node<V> {
    fn is_empty(&self) -> bool {
        self.exact.is_none()
            && self.multi.is_none()
            && self.plus.is_none()
            && self.children.is_empty()
    }
}

/// Maps topic filters to values and finds every value whose filter matches a
/// topic name.
pub struct TopicTrie<V> {
    root: Node<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Value slot for `filter`, creating the path if needed
    pub fn entry(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => return &mut node.multi,
                "+" => node = node.plus.get_or_insert_with(Box::default).as_mut(),
                _ => node = node.children.entry(CompactString::new(level)).or_default(),
            }
        }
        &mut node.exact
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => return node.multi.as_mut(),
                "+" => node = node.plus.as_deref_mut()?,
                _ => node = node.children.get_mut(level)?,
            }
        }
        node.exact.as_mut()
    }

    /// Remove the value for `filter`, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_at(&mut self.root, &levels)
    }

    fn remove_at(node: &mut Node<V>, levels: &[&str]) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return node.exact.take();
        };

        match *level {
            "#" => node.multi.take(),
            "+" => {
                let child = node.plus.as_deref_mut()?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.plus = None;
                }
                removed
            }
            level => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Call `callback` for every value whose filter matches `topic`.
    ///
    /// Topics beginning with `$` are not matched by a `+` or `#` in the first
    /// level.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::match_at(&self.root, &levels, topic.starts_with('$'), &mut callback);
    }

    fn match_at<F>(node: &Node<V>, levels: &[&str], guard_wildcards: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        // `#` also matches the parent level itself
        if !guard_wildcards {
            if let Some(v) = &node.multi {
                callback(v);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            if let Some(v) = &node.exact {
                callback(v);
            }
            return;
        };

        if !guard_wildcards {
            if let Some(child) = &node.plus {
                Self::match_at(child, rest, false, callback);
            }
        }

        if let Some(child) = node.children.get(*level) {
            Self::match_at(child, rest, false, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
