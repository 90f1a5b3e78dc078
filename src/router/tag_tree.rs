//! Tag hierarchy queries used by tag-tree routes.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

/// Answers whether a title sits below any of the given tags.
///
/// A title is in the tree of tag `T` when it is tagged `T`, or tagged with
/// something that is itself in the tree of `T`.
pub trait TagHierarchy: Send + Sync {
    fn is_in_tag_tree(&self, title: &str, root_tags: &[String]) -> bool;
}

/// Hierarchy that never matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTagHierarchy;

impl TagHierarchy for NoTagHierarchy {
    fn is_in_tag_tree(&self, _title: &str, _root_tags: &[String]) -> bool {
        false
    }
}

/// In-memory title -> tags relation.
#[derive(Debug, Default)]
pub struct TagGraph {
    tags: RwLock<HashMap<String, Vec<String>>>,
}

impl TagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags recorded for `title`.
    pub fn set_tags<I, S>(&self, title: impl Into<String>, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .write()
            .insert(title.into(), tags.into_iter().map(Into::into).collect());
    }

    pub fn remove(&self, title: &str) {
        self.tags.write().remove(title);
    }
}

impl TagHierarchy for TagGraph {
    fn is_in_tag_tree(&self, title: &str, root_tags: &[String]) -> bool {
        if root_tags.is_empty() {
            return false;
        }
        let tags = self.tags.read();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([title]);

        // Walk upwards from the title through its tags; cycles stop at `visited`.
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let Some(parents) = tags.get(current) else {
                continue;
            };
            for parent in parents {
                if root_tags.iter().any(|root| root == parent) {
                    return true;
                }
                queue.push_back(parent.as_str());
            }
        }
        false
    }
}
