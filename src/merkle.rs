//! Merkle tree change detection.
//!
//! A snapshot of the indexed file set is stored as a hash tree: file
//! nodes hash their content, directory nodes hash the `(name, hash)`
//! pairs of their children sorted by name. Two snapshots diff in
//! O(changes) — matching subtree hashes short-circuit the comparison.
//!
//! The tree serializes to JSON and is the indexer's persistent state
//! between passes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::walker::{walk, WalkOptions};

/// A node in the tree. Children are keyed by file/directory name;
/// `BTreeMap` keeps them in the sorted order the hash definition
/// requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleNode {
    /// Path relative to the root, `/`-separated. Empty for the root.
    pub path: String,
    /// Hex SHA-256. Files hash their content; directories hash their
    /// children.
    pub hash: String,
    pub is_file: bool,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, MerkleNode>,
}

/// A complete snapshot: the root node plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleTree {
    pub root: MerkleNode,
    /// Number of file nodes in the tree.
    pub file_count: usize,
}

fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

fn hash_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex_digest(hasher))
}

fn directory_hash(children: &BTreeMap<String, MerkleNode>) -> String {
    let mut hasher = Sha256::new();
    for (name, child) in children {
        hasher.update(name.as_bytes());
        hasher.update(child.hash.as_bytes());
    }
    hex_digest(hasher)
}

impl MerkleTree {
    /// Walk `root` with `opts` and build the snapshot. Deterministic for
    /// a given filesystem state and ignore set: the walker sorts its
    /// output and directory hashes iterate sorted children.
    pub fn build(root: &Path, opts: &WalkOptions) -> Result<MerkleTree> {
        let files = walk(root, opts)?;

        let mut tree_root = MerkleNode {
            path: String::new(),
            hash: String::new(),
            is_file: false,
            size: 0,
            children: BTreeMap::new(),
        };
        let mut file_count = 0usize;

        for file in &files {
            let hash = match hash_file(&file.absolute_path) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(path = %file.relative_path, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            insert_file(&mut tree_root, &file.relative_path, hash, file.size);
            file_count += 1;
        }

        finalize_hashes(&mut tree_root);

        Ok(MerkleTree {
            root: tree_root,
            file_count,
        })
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(data: &str) -> Result<MerkleTree> {
        serde_json::from_str(data)
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "corrupt merkle snapshot", e))
    }

    /// Relative paths of every file whose hash differs between the two
    /// snapshots, plus files present in only one of them. Matching
    /// subtree hashes are skipped without descending.
    pub fn diff(old: &MerkleTree, new: &MerkleTree) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        diff_nodes(Some(&old.root), Some(&new.root), &mut changed);
        changed
    }

    /// All file paths in the snapshot, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.file_count);
        collect_files(&self.root, &mut out);
        out
    }

    /// Look up a file node's content hash.
    pub fn file_hash(&self, relative_path: &str) -> Option<&str> {
        let mut node = &self.root;
        for part in relative_path.split('/') {
            node = node.children.get(part)?;
        }
        node.is_file.then_some(node.hash.as_str())
    }
}

fn insert_file(root: &mut MerkleNode, relative_path: &str, hash: String, size: u64) {
    let parts: Vec<&str> = relative_path.split('/').collect();
    let mut node = root;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        let child_path = parts[..=i].join("/");
        node = node
            .children
            .entry((*part).to_string())
            .or_insert_with(|| MerkleNode {
                path: child_path,
                hash: String::new(),
                is_file: is_last,
                size: 0,
                children: BTreeMap::new(),
            });
        if is_last {
            node.is_file = true;
            node.hash = hash.clone();
            node.size = size;
        }
    }
}

fn finalize_hashes(node: &mut MerkleNode) {
    if node.is_file {
        return;
    }
    for child in node.children.values_mut() {
        finalize_hashes(child);
    }
    node.size = node.children.values().map(|c| c.size).sum();
    node.hash = directory_hash(&node.children);
}

fn collect_files(node: &MerkleNode, out: &mut Vec<String>) {
    if node.is_file {
        out.push(node.path.clone());
        return;
    }
    for child in node.children.values() {
        collect_files(child, out);
    }
}

fn collect_files_into_set(node: &MerkleNode, out: &mut BTreeSet<String>) {
    if node.is_file {
        out.insert(node.path.clone());
        return;
    }
    for child in node.children.values() {
        collect_files_into_set(child, out);
    }
}

fn diff_nodes(old: Option<&MerkleNode>, new: Option<&MerkleNode>, changed: &mut BTreeSet<String>) {
    match (old, new) {
        (None, None) => {}
        (Some(only), None) | (None, Some(only)) => {
            // A subtree present on one side only: every file in it changed.
            collect_files_into_set(only, changed);
        }
        (Some(o), Some(n)) => {
            if o.hash == n.hash && o.is_file == n.is_file {
                return;
            }
            match (o.is_file, n.is_file) {
                (true, true) => {
                    changed.insert(n.path.clone());
                }
                (false, false) => {
                    let names: BTreeSet<&String> =
                        o.children.keys().chain(n.children.keys()).collect();
                    for name in names {
                        diff_nodes(o.children.get(name), n.children.get(name), changed);
                    }
                }
                // File replaced by directory or vice versa.
                _ => {
                    collect_files_into_set(o, changed);
                    collect_files_into_set(n, changed);
                }
            }
        }
    }
}
