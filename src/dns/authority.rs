//! Contains the data store for local zones
//!
//! The zone tree maps canonical-ordered names to nodes; an apex and all of
//! its subdomains occupy one contiguous range of the tree, which is what
//! makes NSEC successor/predecessor lookups a plain range scan. The tree is
//! shared between the query path (reads) and the mutation path (writes).

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::DomainName;
use crate::dns::rrset::ZoneEntries;

/// A single owner name and the RRSets that live at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneNode {
    pub name: DomainName,
    pub entries: ZoneEntries,
}

impl ZoneNode {
    pub fn new(name: DomainName) -> ZoneNode {
        ZoneNode {
            name,
            entries: ZoneEntries::new(),
        }
    }
}

/// All nodes of all zones hosted by this server, in canonical order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ZoneTree {
    nodes: BTreeMap<DomainName, ZoneNode>,
}

impl ZoneTree {
    pub fn new() -> ZoneTree {
        ZoneTree::default()
    }

    pub fn find_exact(&self, name: &DomainName) -> Option<&ZoneNode> {
        self.nodes.get(name)
    }

    pub fn find_exact_mut(&mut self, name: &DomainName) -> Option<&mut ZoneNode> {
        self.nodes.get_mut(name)
    }

    /// The apex node plus every subdomain node, in canonical order.
    ///
    /// Canonical order groups an apex and its subtree into one contiguous
    /// range, so this is a bounded scan rather than a filter over the tree.
    pub fn zone_with_subdomains(&self, apex: &DomainName) -> Vec<&ZoneNode> {
        self.nodes
            .range((Included(apex.clone()), Unbounded))
            .map(|(_, node)| node)
            .take_while(|node| node.name.is_subdomain_of(apex))
            .collect()
    }

    /// Owner names at or under the apex, in canonical order.
    pub fn names_under(&self, apex: &DomainName) -> Vec<DomainName> {
        self.zone_with_subdomains(apex)
            .into_iter()
            .map(|node| node.name.clone())
            .collect()
    }

    /// First node under `apex` strictly after `after` in canonical order.
    pub fn next_subdomain(&self, apex: &DomainName, after: &DomainName) -> Option<&ZoneNode> {
        self.nodes
            .range((Excluded(after.clone()), Unbounded))
            .map(|(_, node)| node)
            .take_while(|node| node.name.is_subdomain_of(apex))
            .next()
    }

    /// Last node under `apex` strictly before `before` in canonical order.
    pub fn previous_subdomain(&self, apex: &DomainName, before: &DomainName) -> Option<&ZoneNode> {
        self.nodes
            .range((Included(apex.clone()), Excluded(before.clone())))
            .map(|(_, node)| node)
            .filter(|node| node.name.is_subdomain_of(apex))
            .next_back()
    }

    pub fn get_or_create(&mut self, name: &DomainName) -> &mut ZoneNode {
        self.nodes
            .entry(name.clone())
            .or_insert_with(|| ZoneNode::new(name.clone()))
    }

    pub fn remove(&mut self, name: &DomainName) -> Option<ZoneNode> {
        self.nodes.remove(name)
    }

    pub fn subdomain_exists(&self, apex: &DomainName, name: &DomainName) -> bool {
        name.is_subdomain_of(apex) && self.nodes.contains_key(name)
    }

    /// The closest enclosing node that exists for `name` under `apex`.
    pub fn closest_ancestor(&self, apex: &DomainName, name: &DomainName) -> Option<&ZoneNode> {
        let mut cursor = name.parent();
        while let Some(candidate) = cursor {
            if !candidate.is_subdomain_of(apex) {
                break;
            }
            if let Some(node) = self.nodes.get(&candidate) {
                return Some(node);
            }
            cursor = candidate.parent();
        }
        None
    }
}

/// Shared handle to the zone tree.
///
/// Readers (the query path) take the read lock; all mutation goes through
/// the write lock, so a query sees either the pre-commit or the post-commit
/// state of any RRSet, never an intermediate one.
#[derive(Default)]
pub struct Authority {
    tree: RwLock<ZoneTree>,
}

impl Authority {
    pub fn new() -> Arc<Authority> {
        Arc::new(Authority {
            tree: RwLock::new(ZoneTree::new()),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ZoneTree> {
        self.tree.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ZoneTree> {
        self.tree.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(names: &[&str]) -> ZoneTree {
        let mut tree = ZoneTree::new();
        for name in names {
            tree.get_or_create(&DomainName::new(name));
        }
        tree
    }

    #[test]
    fn test_zone_with_subdomains_is_canonical_and_bounded() {
        let tree = tree_with(&[
            "example.com",
            "www.example.com",
            "a.example.com",
            "z.a.example.com",
            "example.net",
            "com",
        ]);

        let apex = DomainName::new("example.com");
        let names: Vec<&str> = tree
            .zone_with_subdomains(&apex)
            .iter()
            .map(|node| node.name.as_str())
            .collect();

        assert_eq!(
            names,
            vec![
                "example.com",
                "a.example.com",
                "z.a.example.com",
                "www.example.com",
            ]
        );

        let under = tree.names_under(&apex);
        let name_list: Vec<&str> = under.iter().map(|name| name.as_str()).collect();
        assert_eq!(name_list, names);
    }

    #[test]
    fn test_next_and_previous_subdomain() {
        let tree = tree_with(&[
            "example.com",
            "a.example.com",
            "www.example.com",
            "example.net",
        ]);
        let apex = DomainName::new("example.com");

        let next = tree
            .next_subdomain(&apex, &DomainName::new("a.example.com"))
            .unwrap();
        assert_eq!(next.name.as_str(), "www.example.com");

        // Nothing follows the last subdomain.
        assert!(tree
            .next_subdomain(&apex, &DomainName::new("www.example.com"))
            .is_none());

        let prev = tree
            .previous_subdomain(&apex, &DomainName::new("www.example.com"))
            .unwrap();
        assert_eq!(prev.name.as_str(), "a.example.com");

        let prev = tree
            .previous_subdomain(&apex, &DomainName::new("a.example.com"))
            .unwrap();
        assert_eq!(prev.name.as_str(), "example.com");

        assert!(tree
            .previous_subdomain(&apex, &DomainName::new("example.com"))
            .is_none());
    }

    #[test]
    fn test_subdomain_exists_respects_apex() {
        let tree = tree_with(&["example.com", "www.example.com", "example.net"]);
        let apex = DomainName::new("example.com");

        assert!(tree.subdomain_exists(&apex, &DomainName::new("www.example.com")));
        assert!(!tree.subdomain_exists(&apex, &DomainName::new("example.net")));
        assert!(!tree.subdomain_exists(&apex, &DomainName::new("mail.example.com")));
    }

    #[test]
    fn test_closest_ancestor() {
        let tree = tree_with(&["example.com", "b.example.com"]);
        let apex = DomainName::new("example.com");

        let node = tree
            .closest_ancestor(&apex, &DomainName::new("a.b.example.com"))
            .unwrap();
        assert_eq!(node.name.as_str(), "b.example.com");

        let node = tree
            .closest_ancestor(&apex, &DomainName::new("x.y.example.com"))
            .unwrap();
        assert_eq!(node.name.as_str(), "example.com");
    }
}
