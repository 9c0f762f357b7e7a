use std::collections::HashMap;

use crate::types::{JournalAddress, PageKey, Timestamp};

/// One journaled image of a page: when it was written and where it
/// lives in the journal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageNode {
    pub timestamp: Timestamp,
    pub address: JournalAddress,
}

/// The authoritative "where is the latest copy of this page?" index:
/// (volume handle, page address) to a newest-first list of `PageNode`
/// entries. Volume files are a lazy projection of this map.
#[derive(Default, Clone)]
pub struct PageMap {
    map: HashMap<PageKey, Vec<PageNode>>,
}

impl PageMap {
    pub fn new() -> PageMap {
        PageMap {
            map: HashMap::new(),
        }
    }

    /// Record a new image; it becomes the head of the page's list.
    pub fn put(&mut self, key: PageKey, timestamp: Timestamp, address: JournalAddress) {
        let nodes = self.map.entry(key).or_insert_with(Vec::new);
        nodes.insert(0, PageNode { timestamp, address });
    }

    /// Newest journal address holding the page, if any.
    pub fn lookup(&self, key: &PageKey) -> Option<JournalAddress> {
        self.map.get(key).and_then(|n| n.first()).map(|n| n.address)
    }

    /// Newest image whose timestamp does not exceed `limit`.
    pub fn lookup_at(&self, key: &PageKey, limit: Timestamp) -> Option<PageNode> {
        self.map
            .get(key)?
            .iter()
            .find(|n| n.timestamp <= limit)
            .copied()
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Smallest journal address still referenced. Bounds how far the
    /// base address may advance.
    pub fn min_address(&self) -> Option<JournalAddress> {
        self.map
            .values()
            .flat_map(|nodes| nodes.iter().map(|n| n.address))
            .min()
    }

    pub fn keys(&self) -> Vec<PageKey> {
        self.map.keys().copied().collect()
    }

    pub fn nodes(&self, key: &PageKey) -> &[PageNode] {
        self.map.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Iterate every (key, node) pair; used by the PM snapshot writer.
    pub fn entries(&self) -> Vec<(PageKey, PageNode)> {
        let mut out = Vec::new();
        for (key, nodes) in self.map.iter() {
            for node in nodes.iter() {
                out.push((*key, *node));
            }
        }
        out
    }

    /// After the copier wrote the image at `address` to the volume,
    /// every node of the page at or below that address is obsolete.
    pub fn prune_through(&mut self, key: &PageKey, address: JournalAddress) {
        if let Some(nodes) = self.map.get_mut(key) {
            nodes.retain(|n| n.address > address);
            if nodes.is_empty() {
                self.map.remove(key);
            }
        }
    }

    pub fn remove_volume(&mut self, volume: crate::types::VolumeHandle) {
        self.map.retain(|k, _| k.volume != volume);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// One entry per live or recently-committed transaction.
/// `commit_timestamp == 0` marks a live transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMapEntry {
    pub start_timestamp: Timestamp,
    pub commit_timestamp: Timestamp,
    pub start_address: JournalAddress,
    pub last_address: JournalAddress,
}

impl TxMapEntry {
    pub fn is_committed(&self) -> bool {
        self.commit_timestamp != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(page: u64) -> PageKey {
        PageKey::new(1, page)
    }

    #[test]
    fn newest_first() {
        let mut map = PageMap::new();
        map.put(key(5), 10, 1000);
        map.put(key(5), 20, 2000);

        assert_eq!(map.lookup(&key(5)), Some(2000));
        let nodes = map.nodes(&key(5));
        assert_eq!(nodes[0].address, 2000);
        assert_eq!(nodes[1].address, 1000);
    }

    #[test]
    fn lookup_at_respects_limit() {
        let mut map = PageMap::new();
        map.put(key(5), 10, 1000);
        map.put(key(5), 20, 2000);

        assert_eq!(map.lookup_at(&key(5), 15).unwrap().address, 1000);
        assert_eq!(map.lookup_at(&key(5), 25).unwrap().address, 2000);
        assert!(map.lookup_at(&key(5), 5).is_none());
    }

    #[test]
    fn prune_after_copy() {
        let mut map = PageMap::new();
        map.put(key(5), 10, 1000);
        map.put(key(5), 20, 2000);
        map.put(key(6), 10, 1500);

        map.prune_through(&key(5), 2000);
        assert!(map.lookup(&key(5)).is_none());
        assert_eq!(map.min_address(), Some(1500));
    }
}
