use std::collections::HashMap;

const NIL: usize = usize::MAX;

struct Node {
    key: String,
    value: u64,
    prev: usize,
    next: usize,
}

/// Bidirectional bounded LRU cache mapping factor values to their sequences
/// and back. Both lookup directions count as a use and refresh recency; when
/// the cache is full the least-recently-used entry is evicted from both
/// directions. All operations are O(1) amortized.
///
/// Not thread-safe; the factorizer serializes access.
pub struct FactorCache {
    cap: usize,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    by_key: HashMap<String, usize>,
    by_value: HashMap<u64, usize>,
}

impl FactorCache {
    pub fn new(cap: usize) -> FactorCache {
        assert!(cap > 0, "cache capacity must be non-zero");
        FactorCache {
            cap,
            nodes: Vec::with_capacity(cap),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            by_key: HashMap::with_capacity(cap),
            by_value: HashMap::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Insert or replace an entry. Replacing an existing key drops the old
    /// value's reverse mapping; inserting a value already cached under a
    /// different key drops that stale entry to keep the mapping bijective.
    pub fn add(&mut self, key: &str, value: u64) {
        if let Some(&idx) = self.by_key.get(key) {
            let old_value = self.nodes[idx].value;
            if old_value != value {
                self.by_value.remove(&old_value);
                if let Some(&stale) = self.by_value.get(&value) {
                    self.evict(stale);
                }
                self.nodes[idx].value = value;
                self.by_value.insert(value, idx);
            }
            self.touch(idx);
            return;
        }

        if let Some(&stale) = self.by_value.get(&value) {
            self.evict(stale);
        }
        if self.by_key.len() >= self.cap {
            let lru = self.tail;
            self.evict(lru);
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Node {
                    key: key.to_string(),
                    value,
                    prev: NIL,
                    next: NIL,
                };
                idx
            }
            None => {
                self.nodes.push(Node {
                    key: key.to_string(),
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        };
        self.link_front(idx);
        self.by_key.insert(key.to_string(), idx);
        self.by_value.insert(value, idx);
    }

    /// Forward lookup: value string to sequence.
    pub fn get_value(&mut self, key: &str) -> Option<u64> {
        let idx = *self.by_key.get(key)?;
        self.touch(idx);
        Some(self.nodes[idx].value)
    }

    /// Reverse lookup: sequence to value string.
    pub fn get_key(&mut self, value: u64) -> Option<String> {
        let idx = *self.by_value.get(&value)?;
        self.touch(idx);
        Some(self.nodes[idx].key.clone())
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(&idx) = self.by_key.get(key) {
            self.evict(idx);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.by_key.clear();
        self.by_value.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn evict(&mut self, idx: usize) {
        self.unlink(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.by_key.remove(&key);
        self.by_value.remove(&self.nodes[idx].value);
        self.free.push(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.link_front(idx);
        }
    }

    fn link_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }
}
