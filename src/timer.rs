// src/timer.rs
//! Idle-connection timers: a doubly linked list kept in non-decreasing
//! expiry order, backed by an index arena so links are slot indices rather
//! than pointers. Head eviction and removal are O(1); insertion scans
//! forward from the best known starting point.

use std::collections::HashMap;

const NIL: i32 = -1;

struct TimerNode {
    token: u64,
    /// Absolute expiry in seconds.
    expire: u64,
    prev: i32,
    next: i32,
}

pub struct TimerList {
    nodes: Vec<TimerNode>,
    /// Free slots, chained through `next`.
    free_head: i32,
    head: i32,
    tail: i32,
    index: HashMap<u64, i32>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_head: NIL,
            head: NIL,
            tail: NIL,
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, token: u64) -> bool {
        self.index.contains_key(&token)
    }

    /// Registers a deadline for `token`. Re-registering an existing token
    /// replaces its deadline outright.
    pub fn add(&mut self, token: u64, expire: u64) {
        if self.index.contains_key(&token) {
            self.remove(token);
        }
        let idx = self.alloc(token, expire);
        self.index.insert(token, idx);

        if self.head == NIL {
            self.head = idx;
            self.tail = idx;
            return;
        }
        if expire < self.nodes[self.head as usize].expire {
            // New earliest deadline becomes the head in O(1).
            self.nodes[idx as usize].next = self.head;
            self.nodes[self.head as usize].prev = idx;
            self.head = idx;
            return;
        }
        self.insert_after(self.head, idx);
    }

    /// Extends `token`'s deadline. Only extension is supported: the scan for
    /// the new position starts at the node's old successor, which is wrong
    /// for a shrinking deadline (that would need a scan from the head).
    pub fn adjust(&mut self, token: u64, expire: u64) {
        let Some(&idx) = self.index.get(&token) else {
            self.add(token, expire);
            return;
        };
        debug_assert!(expire >= self.nodes[idx as usize].expire);
        self.nodes[idx as usize].expire = expire;

        let next = self.nodes[idx as usize].next;
        if next == NIL || expire < self.nodes[next as usize].expire {
            return; // Already in place.
        }
        self.unlink(idx);
        // The old successor survives the unlink, so `head` is non-nil here.
        // Resume the scan just before that successor; when the moved node
        // was the head this degenerates to a scan from the new head.
        let start = self.nodes[next as usize].prev;
        let start = if start == NIL { self.head } else { start };
        self.insert_after(start, idx);
    }

    /// Drops `token`'s timer, if any. O(1) given the index.
    pub fn remove(&mut self, token: u64) {
        if let Some(idx) = self.index.remove(&token) {
            self.unlink(idx);
            self.free(idx);
        }
    }

    /// Fires every deadline at or before `now`, in expiry order, and returns
    /// the affected tokens. Stops at the first unexpired node; the sort
    /// order makes that sufficient.
    pub fn tick(&mut self, now: u64) -> Vec<u64> {
        let mut expired = Vec::new();
        while self.head != NIL {
            let idx = self.head;
            if now < self.nodes[idx as usize].expire {
                break;
            }
            let token = self.nodes[idx as usize].token;
            self.index.remove(&token);
            self.unlink(idx);
            self.free(idx);
            expired.push(token);
        }
        expired
    }

    /// Expiries in list order, for inspection and tests.
    pub fn expiries(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.len());
        let mut cur = self.head;
        while cur != NIL {
            out.push(self.nodes[cur as usize].expire);
            cur = self.nodes[cur as usize].next;
        }
        out
    }

    fn alloc(&mut self, token: u64, expire: u64) -> i32 {
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.nodes[idx as usize].next;
            let node = &mut self.nodes[idx as usize];
            node.token = token;
            node.expire = expire;
            node.prev = NIL;
            node.next = NIL;
            idx
        } else {
            self.nodes.push(TimerNode {
                token,
                expire,
                prev: NIL,
                next: NIL,
            });
            (self.nodes.len() - 1) as i32
        }
    }

    fn free(&mut self, idx: i32) {
        self.nodes[idx as usize].next = self.free_head;
        self.nodes[idx as usize].prev = NIL;
        self.free_head = idx;
    }

    fn unlink(&mut self, idx: i32) {
        let (prev, next) = {
            let node = &self.nodes[idx as usize];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let node = &mut self.nodes[idx as usize];
        node.prev = NIL;
        node.next = NIL;
    }

    /// Walks forward from `start` and links `idx` before the first node with
    /// a later expiry, or at the tail.
    fn insert_after(&mut self, start: i32, idx: i32) {
        let expire = self.nodes[idx as usize].expire;
        let mut prev = start;
        let mut cur = self.nodes[start as usize].next;
        while cur != NIL && expire >= self.nodes[cur as usize].expire {
            prev = cur;
            cur = self.nodes[cur as usize].next;
        }
        self.nodes[idx as usize].prev = prev;
        self.nodes[idx as usize].next = cur;
        self.nodes[prev as usize].next = idx;
        if cur != NIL {
            self.nodes[cur as usize].prev = idx;
        } else {
            self.tail = idx;
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_keeps_sorted_order() {
        let mut list = TimerList::new();
        for (token, expire) in [(10, 5), (11, 2), (12, 8), (13, 1)] {
            list.add(token, expire);
        }
        assert_eq!(list.expiries(), vec![1, 2, 5, 8]);
    }

    #[test]
    fn tick_fires_expired_prefix_only() {
        let mut list = TimerList::new();
        for (token, expire) in [(10, 5), (11, 2), (12, 8), (13, 1)] {
            list.add(token, expire);
        }
        let fired = list.tick(3);
        assert_eq!(fired, vec![13, 11]);
        assert_eq!(list.expiries(), vec![5, 8]);
        assert!(!list.contains(13));
        assert!(list.contains(10));
    }

    #[test]
    fn tick_at_exact_expiry_fires() {
        let mut list = TimerList::new();
        list.add(1, 7);
        assert_eq!(list.tick(6), Vec::<u64>::new());
        assert_eq!(list.tick(7), vec![1]);
        assert!(list.is_empty());
    }

    #[test]
    fn adjust_extends_and_resorts() {
        let mut list = TimerList::new();
        list.add(1, 2);
        list.add(2, 4);
        list.add(3, 6);
        list.adjust(1, 5);
        assert_eq!(list.expiries(), vec![4, 5, 6]);
        list.adjust(2, 9);
        assert_eq!(list.expiries(), vec![5, 6, 9]);
        // Extension that does not cross a neighbor stays in place.
        list.adjust(1, 5);
        assert_eq!(list.expiries(), vec![5, 6, 9]);
    }

    #[test]
    fn adjust_head_reinserts() {
        let mut list = TimerList::new();
        list.add(1, 1);
        list.add(2, 3);
        list.add(3, 5);
        list.adjust(1, 10);
        assert_eq!(list.expiries(), vec![3, 5, 10]);
        assert_eq!(list.tick(20), vec![2, 3, 1]);
    }

    #[test]
    fn remove_head_tail_interior() {
        let mut list = TimerList::new();
        for (t, e) in [(1, 1), (2, 2), (3, 3), (4, 4)] {
            list.add(t, e);
        }
        list.remove(1); // head
        assert_eq!(list.expiries(), vec![2, 3, 4]);
        list.remove(4); // tail
        assert_eq!(list.expiries(), vec![2, 3]);
        list.remove(3);
        assert_eq!(list.expiries(), vec![2]);
        list.remove(2);
        assert!(list.is_empty());
        // Slots recycle through the free list.
        list.add(9, 7);
        assert_eq!(list.expiries(), vec![7]);
    }

    #[test]
    fn single_element_edge_cases() {
        let mut list = TimerList::new();
        list.add(5, 10);
        list.adjust(5, 12);
        assert_eq!(list.expiries(), vec![12]);
        list.remove(5);
        assert!(list.is_empty());
        assert_eq!(list.tick(100), Vec::<u64>::new());
    }
}
