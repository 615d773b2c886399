//! AVL deduplication tree packed into a flat `u64` array
//!
//! Same structure and algorithm as [`crate::dedup::avl::DedupTree`], but
//! every node is a fixed stride of `u64` words inside one growable buffer.
//! The vertex-indexing pass inserts one entry per triangle corner, so the
//! per-node bookkeeping of a regular arena (and its reallocation churn)
//! is worth avoiding; the buffer grows by whole blocks instead.

/// Words per node: key high, key low, value, balance, parent, left, right
const STRIDE: usize = 7;
const KEY_HI: usize = 0;
const KEY_LO: usize = 1;
const VALUE: usize = 2;
const BALANCE: usize = 3;
const PARENT: usize = 4;
const CHILD: usize = 5; // and 6

/// Growth granularity, in nodes
const BLOCK: usize = 32 * 1024;

const NIL: u64 = u64::MAX;

/// Flat-array AVL map from Morton keys to `i32` indices
#[derive(Default)]
pub struct FlatDedupTree {
    data: Vec<u64>,
    nr: usize,
    root: u64,
}

impl FlatDedupTree {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            nr: 0,
            root: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.nr
    }

    pub fn is_empty(&self) -> bool {
        self.nr == 0
    }

    pub fn clear(&mut self) {
        self.nr = 0;
        self.root = NIL;
    }

    fn key(&self, n: u64) -> u128 {
        let base = n as usize * STRIDE;
        (self.data[base + KEY_HI] as u128) << 64 | self.data[base + KEY_LO] as u128
    }

    fn value(&self, n: u64) -> i32 {
        self.data[n as usize * STRIDE + VALUE] as u32 as i32
    }

    fn balance(&self, n: u64) -> i64 {
        self.data[n as usize * STRIDE + BALANCE] as i64
    }

    fn set_balance(&mut self, n: u64, b: i64) {
        self.data[n as usize * STRIDE + BALANCE] = b as u64;
    }

    fn parent(&self, n: u64) -> u64 {
        self.data[n as usize * STRIDE + PARENT]
    }

    fn set_parent(&mut self, n: u64, p: u64) {
        self.data[n as usize * STRIDE + PARENT] = p;
    }

    fn child(&self, n: u64, dir: usize) -> u64 {
        self.data[n as usize * STRIDE + CHILD + dir]
    }

    fn set_child(&mut self, n: u64, dir: usize, c: u64) {
        self.data[n as usize * STRIDE + CHILD + dir] = c;
    }

    fn push(&mut self, key: u128, value: i32, parent: u64) -> u64 {
        if self.nr * STRIDE == self.data.len() {
            self.data.resize(self.data.len() + BLOCK * STRIDE, 0);
        }
        let n = self.nr as u64;
        let base = self.nr * STRIDE;
        self.data[base + KEY_HI] = (key >> 64) as u64;
        self.data[base + KEY_LO] = key as u64;
        self.data[base + VALUE] = value as u32 as u64;
        self.data[base + BALANCE] = 0;
        self.data[base + PARENT] = parent;
        self.data[base + CHILD] = NIL;
        self.data[base + CHILD + 1] = NIL;
        self.nr += 1;
        n
    }

    /// Looks up the value bound to `key`
    pub fn get(&self, key: u128) -> Option<i32> {
        let mut p = self.root;
        while p != NIL {
            let k = self.key(p);
            if key == k {
                return Some(self.value(p));
            }
            p = self.child(p, (key > k) as usize);
        }
        None
    }

    /// Inserts `key -> value`, returning the previously stored value if the
    /// key was already present
    pub fn insert(&mut self, key: u128, value: i32) -> Option<i32> {
        if self.root == NIL {
            self.root = self.push(key, value, NIL);
            return None;
        }
        let mut unbalanced = self.root;
        let mut p = self.root;
        let (q, dir) = loop {
            let k = self.key(p);
            if key == k {
                return Some(self.value(p));
            }
            if self.balance(p) != 0 {
                unbalanced = p;
            }
            let dir = (key > k) as usize;
            let next = self.child(p, dir);
            if next == NIL {
                break (p, dir);
            }
            p = next;
        };
        let fresh = self.push(key, value, q);
        self.set_child(q, dir, fresh);

        let mut w = unbalanced;
        while w != fresh {
            let d = (key > self.key(w)) as usize;
            let delta = if d == 0 { -1 } else { 1 };
            self.set_balance(w, self.balance(w) + delta);
            w = self.child(w, d);
        }
        match self.balance(unbalanced) {
            -2 => self.rebalance(unbalanced, 0),
            2 => self.rebalance(unbalanced, 1),
            _ => (),
        }
        None
    }

    fn rebalance(&mut self, y: u64, dir: usize) {
        let x = self.child(y, dir);
        let heavy: i64 = if dir == 0 { -1 } else { 1 };
        let top = if self.balance(x) == heavy {
            self.set_balance(y, 0);
            self.set_balance(x, 0);
            self.rotate(y, x, dir);
            x
        } else {
            let z = self.child(x, 1 - dir);
            let zb = self.balance(z);
            self.set_balance(x, if zb == -heavy { heavy } else { 0 });
            self.set_balance(y, if zb == heavy { -heavy } else { 0 });
            self.set_balance(z, 0);
            self.rotate(x, z, 1 - dir);
            self.rotate(y, z, dir);
            z
        };
        let parent = self.parent(top);
        if parent == NIL {
            self.root = top;
        } else {
            let side = (self.child(parent, 1) == y) as usize;
            self.set_child(parent, side, top);
        }
    }

    fn rotate(&mut self, y: u64, x: u64, dir: usize) {
        let t = self.child(x, 1 - dir);
        self.set_child(y, dir, t);
        if t != NIL {
            self.set_parent(t, y);
        }
        let up = self.parent(y);
        self.set_parent(x, up);
        self.set_child(x, 1 - dir, y);
        self.set_parent(y, x);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut t = FlatDedupTree::new();
        assert_eq!(t.insert(42, 7), None);
        assert_eq!(t.insert(42, 8), Some(7));
        assert_eq!(t.insert(1, -3), None);
        assert_eq!(t.get(1), Some(-3));
        assert_eq!(t.get(2), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn negative_values_survive_packing() {
        let mut t = FlatDedupTree::new();
        // external vertices get synthetic negative indices
        for i in 1..100i32 {
            assert_eq!(t.insert(i as u128 * 3, -i), None);
        }
        for i in 1..100i32 {
            assert_eq!(t.get(i as u128 * 3), Some(-i));
        }
    }

    #[test]
    fn wide_keys_do_not_collide() {
        let mut t = FlatDedupTree::new();
        // keys differing only in the high 64 bits
        assert_eq!(t.insert(1u128 << 80, 1), None);
        assert_eq!(t.insert(1u128 << 16, 2), None);
        assert_eq!(t.get(1u128 << 80), Some(1));
        assert_eq!(t.get(1u128 << 16), Some(2));
    }

    #[test]
    fn matches_arena_variant() {
        use crate::dedup::avl::DedupTree;
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(3);
        let mut flat = FlatDedupTree::new();
        let mut arena = DedupTree::new();
        for i in 0..50_000i32 {
            let key = (rng.r#gen::<u64>() % 20_000) as u128;
            assert_eq!(flat.insert(key, i), arena.insert(key, i));
        }
        assert_eq!(flat.len(), arena.len());
    }

    #[test]
    fn grows_past_one_block() {
        let mut t = FlatDedupTree::new();
        for i in 0..(BLOCK as i32 * 2 + 5) {
            t.insert(i as u128, i);
        }
        assert_eq!(t.len(), BLOCK * 2 + 5);
        assert_eq!(t.get(BLOCK as u128), Some(BLOCK as i32));
    }
}
