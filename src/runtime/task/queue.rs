//! Circular doubly-linked queue with O(1) removal by key.
//!
//! Links live in a hash map keyed by the element id rather than in the
//! elements themselves, so `prev`/`next` are plain lookups and nothing hands
//! out node pointers.

use std::hash::Hash;

use ahash::AHashMap;

#[derive(Debug)]
struct Link<K, V> {
    prev: K,
    next: K,
    value: V,
}

#[derive(Debug)]
pub(crate) struct RingQueue<K, V> {
    head: Option<K>,
    links: AHashMap<K, Link<K, V>>,
}

impl<K, V> Default for RingQueue<K, V> {
    fn default() -> Self {
        Self {
            head: None,
            links: AHashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash, V> RingQueue<K, V> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn contains(&self, key: K) -> bool {
        self.links.contains_key(&key)
    }

    pub(crate) fn head_key(&self) -> Option<K> {
        self.head
    }

    pub(crate) fn head(&self) -> Option<&V> {
        self.head.and_then(|key| self.get(key))
    }

    pub(crate) fn get(&self, key: K) -> Option<&V> {
        self.links.get(&key).map(|link| &link.value)
    }

    pub(crate) fn next_of(&self, key: K) -> Option<&V> {
        let next = self.links.get(&key)?.next;
        self.get(next)
    }

    pub(crate) fn prev_of(&self, key: K) -> Option<&V> {
        let prev = self.links.get(&key)?.prev;
        self.get(prev)
    }

    /// Appends at the tail, which is the slot just before the head.
    pub(crate) fn push_back(&mut self, key: K, value: V) {
        match self.head {
            Some(head) => self.link_before(head, key, value),
            None => {
                self.links.insert(
                    key,
                    Link {
                        prev: key,
                        next: key,
                        value,
                    },
                );
                self.head = Some(key);
            }
        }
    }

    /// Inserts in front of the current head and makes the new element the head.
    pub(crate) fn push_front(&mut self, key: K, value: V) {
        self.push_back(key, value);
        self.head = Some(key);
    }

    fn link_before(&mut self, anchor: K, key: K, value: V) {
        let Some(prev) = self.links.get(&anchor).map(|link| link.prev) else {
            return;
        };
        self.links.insert(
            key,
            Link {
                prev,
                next: anchor,
                value,
            },
        );
        if let Some(link) = self.links.get_mut(&prev) {
            link.next = key;
        }
        if let Some(link) = self.links.get_mut(&anchor) {
            link.prev = key;
        }
    }

    pub(crate) fn remove(&mut self, key: K) -> Option<V> {
        let link = self.links.remove(&key)?;
        if self.links.is_empty() {
            self.head = None;
            return Some(link.value);
        }
        if let Some(prev) = self.links.get_mut(&link.prev) {
            prev.next = link.next;
        }
        if let Some(next) = self.links.get_mut(&link.next) {
            next.prev = link.prev;
        }
        if self.head == Some(key) {
            self.head = Some(link.next);
        }
        Some(link.value)
    }

    pub(crate) fn pop_front(&mut self) -> Option<V> {
        let head = self.head?;
        self.remove(head)
    }

    /// Moves the head one step forward, sending the old head to the tail.
    pub(crate) fn rotate(&mut self) {
        if let Some(head) = self.head {
            self.head = self.links.get(&head).map(|link| link.next);
        }
    }

    pub(crate) fn set_head(&mut self, key: K) -> bool {
        if self.links.contains_key(&key) {
            self.head = Some(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            queue: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }
}

pub(crate) struct Iter<'a, K, V> {
    queue: &'a RingQueue<K, V>,
    cursor: Option<K>,
    remaining: usize,
}

impl<'a, K: Copy + Eq + Hash, V> Iterator for Iter<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let link = self.queue.links.get(&self.cursor?)?;
        self.remaining -= 1;
        self.cursor = Some(link.next);
        Some(&link.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(queue: &RingQueue<u32, &'static str>) -> Vec<&'static str> {
        queue.iter().copied().collect()
    }

    #[test]
    fn push_back_keeps_fifo_order() {
        let mut queue = RingQueue::new();
        queue.push_back(1, "a");
        queue.push_back(2, "b");
        queue.push_back(3, "c");
        assert_eq!(order(&queue), ["a", "b", "c"]);
        assert_eq!(queue.pop_front(), Some("a"));
        assert_eq!(order(&queue), ["b", "c"]);
    }

    #[test]
    fn links_are_circular() {
        let mut queue = RingQueue::new();
        queue.push_back(1, "a");
        assert_eq!(queue.next_of(1), Some(&"a"));
        assert_eq!(queue.prev_of(1), Some(&"a"));

        queue.push_back(2, "b");
        queue.push_back(3, "c");
        assert_eq!(queue.next_of(3), Some(&"a"));
        assert_eq!(queue.prev_of(1), Some(&"c"));
        assert_eq!(queue.next_of(9), None);
    }

    #[test]
    fn push_front_becomes_head() {
        let mut queue = RingQueue::new();
        queue.push_back(1, "a");
        queue.push_back(2, "b");
        queue.push_front(3, "c");
        assert_eq!(order(&queue), ["c", "a", "b"]);
    }

    #[test]
    fn removing_the_head_advances_it() {
        let mut queue = RingQueue::new();
        queue.push_back(1, "a");
        queue.push_back(2, "b");
        queue.push_back(3, "c");
        assert_eq!(queue.remove(1), Some("a"));
        assert_eq!(queue.head(), Some(&"b"));
        assert_eq!(queue.remove(3), Some("c"));
        assert_eq!(queue.remove(3), None);
        assert_eq!(queue.remove(2), Some("b"));
        assert!(queue.is_empty());
        assert_eq!(queue.head_key(), None);
    }

    #[test]
    fn rotate_moves_head_to_tail() {
        let mut queue = RingQueue::new();
        queue.push_back(1, "a");
        queue.push_back(2, "b");
        queue.push_back(3, "c");
        queue.rotate();
        assert_eq!(order(&queue), ["b", "c", "a"]);
        assert!(queue.set_head(3));
        assert_eq!(order(&queue), ["c", "a", "b"]);
        assert!(!queue.set_head(7));
    }
}
