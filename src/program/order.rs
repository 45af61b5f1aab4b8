use anyhow::anyhow;
use petgraph::stable_graph::NodeIndex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<NodeIndex>,
    next: Option<NodeIndex>,
}

/// Topological order of the live nodes as a doubly linked list keyed by node
/// index: insertion next to a known node and unlinking are O(1).
#[derive(Debug, Clone, Default)]
pub struct ProcessingOrder {
    head: Option<NodeIndex>,
    tail: Option<NodeIndex>,
    links: HashMap<NodeIndex, Link>,
}

impl ProcessingOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sequence(seq: impl IntoIterator<Item = NodeIndex>) -> Self {
        let mut order = Self::new();
        for idx in seq {
            order.push_back(idx);
        }
        order
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, idx: NodeIndex) -> bool {
        self.links.contains_key(&idx)
    }

    pub fn first(&self) -> Option<NodeIndex> {
        self.head
    }

    pub fn last(&self) -> Option<NodeIndex> {
        self.tail
    }

    pub fn prev(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.links.get(&idx).and_then(|l| l.prev)
    }

    pub fn next(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.links.get(&idx).and_then(|l| l.next)
    }

    pub fn push_back(&mut self, idx: NodeIndex) {
        if self.contains(idx) {
            return;
        }
        self.links.insert(idx, Link { prev: self.tail, next: None });
        match self.tail {
            Some(t) => self.set_next(t, Some(idx)),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    pub fn insert_before(&mut self, anchor: NodeIndex, idx: NodeIndex) -> anyhow::Result<()> {
        let prev = self.links.get(&anchor).ok_or_else(|| anyhow!("node {:?} is not in processing order", anchor))?.prev;
        if self.contains(idx) {
            return Err(anyhow!("node {:?} is already in processing order", idx));
        }
        self.links.insert(idx, Link { prev, next: Some(anchor) });
        self.set_prev(anchor, Some(idx));
        match prev {
            Some(p) => self.set_next(p, Some(idx)),
            None => self.head = Some(idx),
        }
        Ok(())
    }

    pub fn insert_after(&mut self, anchor: NodeIndex, idx: NodeIndex) -> anyhow::Result<()> {
        match self.next(anchor) {
            Some(next) => self.insert_before(next, idx),
            None if self.contains(anchor) => {
                self.push_back(idx);
                Ok(())
            }
            None => Err(anyhow!("node {:?} is not in processing order", anchor)),
        }
    }

    /// Unlinks `idx`; returns false when it was not present.
    pub fn erase(&mut self, idx: NodeIndex) -> bool {
        let Some(link) = self.links.remove(&idx) else { return false };
        match link.prev {
            Some(p) => self.set_next(p, link.next),
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => self.set_prev(n, link.prev),
            None => self.tail = link.prev,
        }
        true
    }

    pub fn iter(&self) -> OrderIter<'_> {
        OrderIter { order: self, cur: self.head }
    }

    pub fn to_vec(&self) -> Vec<NodeIndex> {
        self.iter().collect()
    }

    /// Position of every node, the "processing number".
    pub fn positions(&self) -> HashMap<NodeIndex, usize> {
        self.iter().enumerate().map(|(i, idx)| (idx, i)).collect()
    }

    fn set_next(&mut self, idx: NodeIndex, next: Option<NodeIndex>) {
        if let Some(l) = self.links.get_mut(&idx) {
            l.next = next;
        }
    }

    fn set_prev(&mut self, idx: NodeIndex, prev: Option<NodeIndex>) {
        if let Some(l) = self.links.get_mut(&idx) {
            l.prev = prev;
        }
    }
}

pub struct OrderIter<'a> {
    order: &'a ProcessingOrder,
    cur: Option<NodeIndex>,
}

impl Iterator for OrderIter<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        let cur = self.cur?;
        self.cur = self.order.next(cur);
        Some(cur)
    }
}
