//! Hierarchical view over flat archive entry paths.
//!
//! Construction goes through an arena keyed by cumulative path, so every
//! directory implied by several files is created exactly once. The finished
//! arena is then materialized into owned [`FileTreeNode`]s with every level
//! sorted directories-first.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTreeNode {
    pub name: String,
    /// Slash-delimited path relative to the archive root.
    pub path: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileTreeNode>>,
}

impl FileTreeNode {
    fn file(name: String, path: String) -> Self {
        Self {
            name,
            path,
            is_directory: false,
            children: None,
        }
    }

    pub fn children(&self) -> &[FileTreeNode] {
        self.children.as_deref().unwrap_or_default()
    }

    /// Depth-first search for a node by its full path.
    pub fn find<'a>(nodes: &'a [FileTreeNode], path: &str) -> Option<&'a FileTreeNode> {
        for node in nodes {
            if node.path == path {
                return Some(node);
            }
            if node.is_directory && path.starts_with(&format!("{}/", node.path)) {
                return Self::find(node.children(), path);
            }
        }
        None
    }

    /// Number of file (non-directory) nodes in the forest.
    pub fn count_files(nodes: &[FileTreeNode]) -> usize {
        nodes
            .iter()
            .map(|n| {
                if n.is_directory {
                    Self::count_files(n.children())
                } else {
                    1
                }
            })
            .sum()
    }
}

struct ArenaNode {
    name: String,
    path: String,
    is_directory: bool,
    children: Vec<usize>,
}

#[derive(Default)]
struct Arena {
    nodes: Vec<ArenaNode>,
    by_path: HashMap<String, usize>,
    roots: Vec<usize>,
}

impl Arena {
    /// Returns the node for `path`, creating and linking it under `parent` once.
    fn get_or_insert(&mut self, parent: Option<usize>, name: &str, path: String, is_directory: bool) -> usize {
        if let Some(&idx) = self.by_path.get(&path) {
            // A path used both as a file and as a directory prefix is a directory.
            if is_directory {
                self.nodes[idx].is_directory = true;
            }
            return idx;
        }

        let idx = self.nodes.len();
        self.nodes.push(ArenaNode {
            name: name.to_string(),
            path: path.clone(),
            is_directory,
            children: Vec::new(),
        });
        self.by_path.insert(path, idx);
        match parent {
            Some(p) => self.nodes[p].children.push(idx),
            None => self.roots.push(idx),
        }
        idx
    }

    fn materialize(&self, idx: usize) -> FileTreeNode {
        let node = &self.nodes[idx];
        if !node.is_directory {
            return FileTreeNode::file(node.name.clone(), node.path.clone());
        }
        let mut children: Vec<FileTreeNode> = node.children.iter().map(|&c| self.materialize(c)).collect();
        sort_level(&mut children);
        FileTreeNode {
            name: node.name.clone(),
            path: node.path.clone(),
            is_directory: true,
            children: Some(children),
        }
    }
}

/// Directories before files; names compared case-insensitively first, then
/// byte-wise so the order is total and stable.
pub fn compare_nodes(a: &FileTreeNode, b: &FileTreeNode) -> Ordering {
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

fn sort_level(nodes: &mut [FileTreeNode]) {
    nodes.sort_by(compare_nodes);
}

/// Builds the sorted forest for a set of archive entry paths.
///
/// Explicit directory entries (trailing `/`) are ignored; directories are
/// always inferred from file paths. Empty segments are dropped, and repeated
/// paths produce a single node.
pub fn build_tree<I, S>(entry_paths: I) -> Vec<FileTreeNode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut arena = Arena::default();

    for raw in entry_paths {
        let raw = raw.as_ref();
        if raw.ends_with('/') {
            continue;
        }
        let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        let Some((file_name, dirs)) = segments.split_last() else {
            continue;
        };

        let mut parent = None;
        let mut path = String::new();
        for dir in dirs {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(dir);
            parent = Some(arena.get_or_insert(parent, dir, path.clone(), true));
        }

        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(file_name);
        arena.get_or_insert(parent, file_name, path, false);
    }

    let mut roots: Vec<FileTreeNode> = arena.roots.iter().map(|&r| arena.materialize(r)).collect();
    sort_level(&mut roots);
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(nodes: &[FileTreeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_shared_ancestor_created_once() {
        let tree = build_tree(["src/a.js", "src/b.js", "src/lib/c.js"]);
        assert_eq!(tree.len(), 1);
        let src = &tree[0];
        assert!(src.is_directory);
        assert_eq!(src.path, "src");
        assert_eq!(names(src.children()), vec!["lib", "a.js", "b.js"]);
        let lib = &src.children()[0];
        assert_eq!(lib.path, "src/lib");
        assert_eq!(lib.children()[0].path, "src/lib/c.js");
        assert!(lib.children()[0].children.is_none());
    }

    #[test]
    fn test_directories_first_at_root() {
        let tree = build_tree(["index.html", "scripts/main.js", "README.md", "assets/x.css"]);
        assert_eq!(names(&tree), vec!["assets", "scripts", "index.html", "README.md"]);
        assert!(tree.iter().all(|n| !n.path.contains('/')));
    }

    #[test]
    fn test_duplicate_paths_single_node() {
        let tree = build_tree(["a/b.txt", "a/b.txt", "c.txt", "c.txt"]);
        assert_eq!(names(&tree), vec!["a", "c.txt"]);
        assert_eq!(tree[0].children().len(), 1);
        assert_eq!(FileTreeNode::count_files(&tree), 2);
    }

    #[test]
    fn test_explicit_directory_entries_are_ignored() {
        let tree = build_tree(["empty/", "src/", "src/main.js"]);
        assert_eq!(names(&tree), vec!["src"]);
    }

    #[test]
    fn test_case_ordering_is_deterministic() {
        let tree = build_tree(["b.js", "B.js", "a.js", "C.js"]);
        assert_eq!(names(&tree), vec!["a.js", "B.js", "b.js", "C.js"]);
    }

    #[test]
    fn test_find_and_serialize() {
        let tree = build_tree(["scripts/main.js"]);
        let node = FileTreeNode::find(&tree, "scripts/main.js").unwrap();
        assert_eq!(node.name, "main.js");
        assert!(FileTreeNode::find(&tree, "scripts/other.js").is_none());

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json[0]["isDirectory"], true);
        assert!(json[0]["children"][0].get("children").is_none());
    }

    #[test]
    fn test_file_promoted_when_used_as_directory() {
        let tree = build_tree(["a", "a/b.js"]);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].is_directory);
        assert_eq!(names(tree[0].children()), vec!["b.js"]);
    }
}
