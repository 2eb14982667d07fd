//! A binary min-heap addressable by key.
//!
//! Alongside the heap array lives a key → index map that is kept in sync on
//! every swap, so removing or mutating an arbitrary element by key is
//! O(log n) instead of a linear scan.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, T> {
    key: K,
    value: T,
}

pub struct KeyedHeap<K, T> {
    heap: Vec<Node<K, T>>,
    index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, T: Ord> KeyedHeap<K, T> {
    pub fn new() -> Self {
        KeyedHeap {
            heap: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// The smallest element, if any.
    pub fn peek(&self) -> Option<(&K, &T)> {
        self.heap.first().map(|node| (&node.key, &node.value))
    }

    /// Insert; rejects a key that is already present.
    pub fn push(&mut self, key: K, value: T) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        let at = self.heap.len();
        self.index.insert(key.clone(), at);
        self.heap.push(Node { key, value });
        self.sift_up(at);
        true
    }

    /// Remove and return the smallest element.
    pub fn pop(&mut self) -> Option<(K, T)> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove an arbitrary element by key.
    pub fn remove(&mut self, key: &K) -> Option<T> {
        let at = *self.index.get(key)?;
        Some(self.remove_at(at).1)
    }

    /// Mutate the element for `key` in place and restore heap order.
    pub fn update(&mut self, key: &K, mutate: impl FnOnce(&mut T)) -> bool {
        let Some(&at) = self.index.get(key) else {
            return false;
        };
        mutate(&mut self.heap[at].value);
        if !self.sift_down(at) {
            self.sift_up(at);
        }
        true
    }

    /// Mutate every element, then re-establish the heap property.
    pub fn update_all(&mut self, mut mutate: impl FnMut(&mut T)) {
        for node in &mut self.heap {
            mutate(&mut node.value);
        }
        for at in (0..self.heap.len() / 2).rev() {
            self.sift_down(at);
        }
    }

    fn remove_at(&mut self, at: usize) -> (K, T) {
        let last = self.heap.len() - 1;
        self.swap_nodes(at, last);
        let node = self.heap.pop().expect("non-empty heap");
        self.index.remove(&node.key);
        if at < self.heap.len() && !self.sift_down(at) {
            self.sift_up(at);
        }
        (node.key, node.value)
    }

    fn sift_up(&mut self, mut at: usize) -> bool {
        let start = at;
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[at].value >= self.heap[parent].value {
                break;
            }
            self.swap_nodes(at, parent);
            at = parent;
        }
        at < start
    }

    fn sift_down(&mut self, mut at: usize) -> bool {
        let start = at;
        let n = self.heap.len();
        loop {
            let left = 2 * at + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.heap[right].value < self.heap[left].value {
                child = right;
            }
            if self.heap[at].value <= self.heap[child].value {
                break;
            }
            self.swap_nodes(at, child);
            at = child;
        }
        at > start
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        *self.index.get_mut(&self.heap[a].key).expect("indexed key") = a;
        *self.index.get_mut(&self.heap[b].key).expect("indexed key") = b;
    }
}

impl<K: Eq + Hash + Clone, T: Ord> Default for KeyedHeap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_ascending_order() {
        let mut heap = KeyedHeap::new();
        for (key, value) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
            assert!(heap.push(key, value));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).collect();
        assert_eq!(order, vec![("a", 10), ("b", 20), ("c", 30), ("d", 40)]);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let mut heap = KeyedHeap::new();
        assert!(heap.push("k", 1));
        assert!(!heap.push("k", 2));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn removes_by_key_anywhere_in_the_heap() {
        let mut heap = KeyedHeap::new();
        for i in 0..50 {
            heap.push(i, i * 7 % 50);
        }
        assert_eq!(heap.remove(&25), Some(25 * 7 % 50));
        assert!(!heap.contains(&25));
        assert_eq!(heap.len(), 49);

        let mut last = -1i32;
        while let Some((_, v)) = heap.pop() {
            assert!(v as i32 >= last);
            last = v as i32;
        }
    }

    #[test]
    fn update_restores_heap_order() {
        let mut heap = KeyedHeap::new();
        heap.push("a", 10);
        heap.push("b", 20);
        heap.push("c", 30);
        assert!(heap.update(&"c", |v| *v = 1));
        assert_eq!(heap.peek(), Some((&"c", &1)));
        assert!(!heap.update(&"zz", |v| *v = 0));
    }

    #[test]
    fn update_all_reheapifies() {
        let mut heap = KeyedHeap::new();
        for i in 0..10 {
            heap.push(i, i);
        }
        // Invert the ordering of every element.
        heap.update_all(|v| *v = 100 - *v);
        assert_eq!(heap.peek(), Some((&9, &91)));
    }
}
