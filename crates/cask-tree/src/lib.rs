//! # cask-tree
//!
//! In-memory namespace tree for the Cask container filesystem.
//!
//! Directories map child names to nodes. A file node carries only its name
//! and a stable [`FileId`]; the file's size and block list live in the
//! metadata header's file table, keyed by that id. Renaming or moving a node
//! therefore never invalidates the block index.
//!
//! This crate performs no I/O.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by directory lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("{0} is a file, not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory, not a file")]
    NotAFile(String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// Stable identity of a file, assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A namespace entry: either a directory or a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Directory(Directory),
    File(FileNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Directory(dir) => dir.name(),
            Node::File(file) => file.name(),
        }
    }

    /// Set the stored name.
    ///
    /// The parent's map entry is NOT migrated: callers detach the node first
    /// and re-insert it under the new key.
    pub fn rename(&mut self, new_name: impl Into<String>) {
        match self {
            Node::Directory(dir) => dir.name = new_name.into(),
            Node::File(file) => file.name = new_name.into(),
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// Collect every file id in this node's subtree (the node itself included).
    pub fn file_ids(&self) -> Vec<FileId> {
        match self {
            Node::File(file) => vec![file.id],
            Node::Directory(dir) => dir.file_ids(),
        }
    }
}

impl From<Directory> for Node {
    fn from(dir: Directory) -> Self {
        Node::Directory(dir)
    }
}

impl From<FileNode> for Node {
    fn from(file: FileNode) -> Self {
        Node::File(file)
    }
}

/// File entry in the namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    name: String,
    id: FileId,
}

impl FileNode {
    pub fn new(name: impl Into<String>, id: FileId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> FileId {
        self.id
    }
}

/// Directory entry: child name → node.
///
/// Serialized as the name followed by the children sorted by name, so equal
/// trees always produce equal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    name: String,
    #[serde(with = "sorted_children")]
    children: HashMap<String, Node>,
}

mod sorted_children {
    use std::collections::HashMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Node;

    pub fn serialize<S: Serializer>(
        children: &HashMap<String, Node>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut nodes: Vec<&Node> = children.values().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        serializer.collect_seq(nodes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Node>, D::Error> {
        let nodes = Vec::<Node>::deserialize(deserializer)?;
        let mut children = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let name = node.name().to_string();
            if children.insert(name.clone(), node).is_some() {
                return Err(D::Error::custom(format!("duplicate entry {:?}", name)));
            }
        }
        Ok(children)
    }
}

impl Directory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: HashMap::new(),
        }
    }

    /// The unnamed root directory
    pub fn root() -> Self {
        Self::new("")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a node under its own name, replacing any previous entry.
    pub fn add(&mut self, node: impl Into<Node>) -> Option<Node> {
        let node = node.into();
        self.children.insert(node.name().to_string(), node)
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.children
            .get(name)
            .ok_or_else(|| TreeError::NotFound(name.to_string()))
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.children
            .get_mut(name)
            .ok_or_else(|| TreeError::NotFound(name.to_string()))
    }

    pub fn directory(&self, name: &str) -> Result<&Directory> {
        match self.node(name)? {
            Node::Directory(dir) => Ok(dir),
            Node::File(_) => Err(TreeError::NotADirectory(name.to_string())),
        }
    }

    pub fn directory_mut(&mut self, name: &str) -> Result<&mut Directory> {
        match self.node_mut(name)? {
            Node::Directory(dir) => Ok(dir),
            Node::File(_) => Err(TreeError::NotADirectory(name.to_string())),
        }
    }

    pub fn file(&self, name: &str) -> Result<&FileNode> {
        match self.node(name)? {
            Node::File(file) => Ok(file),
            Node::Directory(_) => Err(TreeError::NotAFile(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn is_directory(&self, name: &str) -> bool {
        matches!(self.children.get(name), Some(Node::Directory(_)))
    }

    pub fn is_file(&self, name: &str) -> bool {
        matches!(self.children.get(name), Some(Node::File(_)))
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    /// Names of the direct children (unordered)
    pub fn contents(&self) -> HashSet<String> {
        self.children.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Iterate over direct children
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.children.values()
    }

    /// Every file id below this directory, depth first.
    pub fn file_ids(&self) -> Vec<FileId> {
        let mut ids = Vec::new();
        let mut stack = vec![self];
        while let Some(dir) = stack.pop() {
            for child in dir.children.values() {
                match child {
                    Node::File(file) => ids.push(file.id),
                    Node::Directory(sub) => stack.push(sub),
                }
            }
        }
        ids
    }

    /// Count files and directories below this directory (self excluded).
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let mut stack = vec![self];
        while let Some(dir) = stack.pop() {
            for child in dir.children.values() {
                match child {
                    Node::File(_) => stats.file_count += 1,
                    Node::Directory(sub) => {
                        stats.dir_count += 1;
                        stack.push(sub);
                    }
                }
            }
        }
        stats
    }
}

/// Entry counts for a subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub file_count: u64,
    pub dir_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Directory {
        let mut root = Directory::root();
        let mut usr = Directory::new("usr");
        usr.add(FileNode::new("a.txt", FileId(1)));
        usr.add(Directory::new("bin"));
        root.add(usr);
        root.add(FileNode::new("b.txt", FileId(2)));
        root
    }

    #[test]
    fn test_add_and_lookup() {
        let root = sample();
        assert!(root.contains("usr"));
        assert!(root.is_directory("usr"));
        assert!(root.is_file("b.txt"));
        assert!(!root.is_file("usr"));
        assert!(!root.contains("etc"));

        let usr = root.directory("usr").unwrap();
        assert_eq!(usr.file("a.txt").unwrap().id(), FileId(1));
    }

    #[test]
    fn test_wrong_kind_is_distinct_from_missing() {
        let root = sample();
        assert_eq!(
            root.directory("b.txt"),
            Err(TreeError::NotADirectory("b.txt".to_string()))
        );
        assert_eq!(
            root.file("usr").unwrap_err(),
            TreeError::NotAFile("usr".to_string())
        );
        assert_eq!(
            root.node("etc").unwrap_err(),
            TreeError::NotFound("etc".to_string())
        );
    }

    #[test]
    fn test_add_replaces_by_name() {
        let mut root = Directory::root();
        assert!(root.add(Directory::new("x")).is_none());
        let previous = root.add(FileNode::new("x", FileId(9)));
        assert!(previous.unwrap().is_directory());
        assert!(root.is_file("x"));
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_rename_does_not_migrate_map_key() {
        let mut root = sample();
        root.node_mut("b.txt").unwrap().rename("c.txt");

        // Key is still the old one until the caller re-inserts
        assert!(root.contains("b.txt"));
        assert_eq!(root.node("b.txt").unwrap().name(), "c.txt");

        let node = root.remove("b.txt").unwrap();
        root.add(node);
        assert!(root.contains("c.txt"));
        assert!(!root.contains("b.txt"));
    }

    #[test]
    fn test_contents_and_empty() {
        let mut root = sample();
        let contents = root.contents();
        assert_eq!(contents.len(), 2);
        assert!(contents.contains("usr") && contents.contains("b.txt"));

        let bin = root.directory("usr").unwrap().directory("bin").unwrap();
        assert!(bin.is_empty());

        root.remove("usr");
        root.remove("b.txt");
        assert!(root.is_empty());
    }

    #[test]
    fn test_file_ids_and_stats() {
        let root = sample();
        let mut ids = root.file_ids();
        ids.sort();
        assert_eq!(ids, vec![FileId(1), FileId(2)]);

        let stats = root.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.dir_count, 2);

        let usr = root.node("usr").unwrap();
        assert_eq!(usr.file_ids(), vec![FileId(1)]);
    }

    // ==================== Serialization ====================

    #[test]
    fn test_serialized_children_are_name_ordered() {
        let mut forward = Directory::root();
        let mut backward = Directory::root();
        for name in ["a", "b", "c", "d", "e", "f"] {
            forward.add(FileNode::new(name, FileId(1)));
        }
        for name in ["f", "e", "d", "c", "b", "a"] {
            backward.add(FileNode::new(name, FileId(1)));
        }
        assert_eq!(
            bincode::serialize(&forward).unwrap(),
            bincode::serialize(&backward).unwrap()
        );

        let bytes = bincode::serialize(&sample()).unwrap();
        let decoded: Directory = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_duplicate_child_is_rejected() {
        // Hand-built form of a root holding two files named "x"
        let twins = (
            String::new(),
            vec![
                Node::File(FileNode::new("x", FileId(1))),
                Node::File(FileNode::new("x", FileId(2))),
            ],
        );
        let bytes = bincode::serialize(&twins).unwrap();
        assert!(bincode::deserialize::<Directory>(&bytes).is_err());
    }
}
