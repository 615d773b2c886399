//! Arena-backed AVL tree with parent links and duplicate detection

const NIL: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
struct Node {
    key: u128,
    value: i32,
    balance: i8,
    parent: u32,
    child: [u32; 2],
}

/// Balanced map from Morton keys to `i32` indices
///
/// Nodes live in a `Vec` arena and carry parent links, so rebalancing never
/// recurses and the tree can grow to millions of entries without touching
/// the call stack.
#[derive(Default)]
pub struct DedupTree {
    nodes: Vec<Node>,
    root: u32,
}

impl DedupTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NIL,
        }
    }

    /// Number of distinct keys stored
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NIL;
    }

    /// Looks up the value bound to `key`
    pub fn get(&self, key: u128) -> Option<i32> {
        let mut p = self.root;
        while p != NIL {
            let n = &self.nodes[p as usize];
            if key == n.key {
                return Some(n.value);
            }
            p = n.child[(key > n.key) as usize];
        }
        None
    }

    /// Inserts `key -> value`, returning the previously stored value if the
    /// key was already present (in which case the tree is unchanged)
    pub fn insert(&mut self, key: u128, value: i32) -> Option<i32> {
        if self.root == NIL {
            self.root = self.push(key, value, NIL);
            return None;
        }
        // find the insertion point, remembering the deepest unbalanced
        // ancestor: only the path below it needs balance updates
        let mut unbalanced = self.root;
        let mut p = self.root;
        let (q, dir) = loop {
            let n = &self.nodes[p as usize];
            if key == n.key {
                return Some(n.value);
            }
            if n.balance != 0 {
                unbalanced = p;
            }
            let dir = (key > n.key) as usize;
            let next = n.child[dir];
            if next == NIL {
                break (p, dir);
            }
            p = next;
        };
        let fresh = self.push(key, value, q);
        self.nodes[q as usize].child[dir] = fresh;

        let mut w = unbalanced;
        while w != fresh {
            let node = &mut self.nodes[w as usize];
            let d = (key > node.key) as usize;
            node.balance += if d == 0 { -1 } else { 1 };
            w = node.child[d];
        }
        match self.nodes[unbalanced as usize].balance {
            -2 => self.rebalance(unbalanced, 0),
            2 => self.rebalance(unbalanced, 1),
            _ => (),
        }
        None
    }

    fn push(&mut self, key: u128, value: i32, parent: u32) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            key,
            value,
            balance: 0,
            parent,
            child: [NIL, NIL],
        });
        id
    }

    /// Restores the AVL invariant at `y`, whose subtree on side `dir` has
    /// become two levels deeper than its sibling
    fn rebalance(&mut self, y: u32, dir: usize) {
        let x = self.nodes[y as usize].child[dir];
        let heavy = if dir == 0 { -1 } else { 1 };
        let top = if self.nodes[x as usize].balance == heavy {
            // single rotation
            self.nodes[y as usize].balance = 0;
            self.nodes[x as usize].balance = 0;
            self.rotate(y, x, dir);
            x
        } else {
            // the inner grandchild ends up on top
            let z = self.nodes[x as usize].child[1 - dir];
            let zb = self.nodes[z as usize].balance;
            self.nodes[x as usize].balance = if zb == -heavy { heavy } else { 0 };
            self.nodes[y as usize].balance = if zb == heavy { -heavy } else { 0 };
            self.nodes[z as usize].balance = 0;
            self.rotate(x, z, 1 - dir);
            self.rotate(y, z, dir);
            z
        };
        let parent = self.nodes[top as usize].parent;
        if parent == NIL {
            self.root = top;
        } else {
            let p = &mut self.nodes[parent as usize];
            let side = (p.child[1] == y) as usize;
            p.child[side] = top;
        }
    }

    /// Rotates `x` (a child of `y` on side `dir`) above `y`
    fn rotate(&mut self, y: u32, x: u32, dir: usize) {
        let t = self.nodes[x as usize].child[1 - dir];
        self.nodes[y as usize].child[dir] = t;
        if t != NIL {
            self.nodes[t as usize].parent = y;
        }
        self.nodes[x as usize].parent = self.nodes[y as usize].parent;
        self.nodes[x as usize].child[1 - dir] = y;
        self.nodes[y as usize].parent = x;
    }

    /// Visits all entries in ascending key order
    pub fn iter(&self) -> Iter<'_> {
        let mut stack = Vec::new();
        let mut p = self.root;
        while p != NIL {
            stack.push(p);
            p = self.nodes[p as usize].child[0];
        }
        Iter { tree: self, stack }
    }
}

pub struct Iter<'a> {
    tree: &'a DedupTree,
    stack: Vec<u32>,
}

impl Iterator for Iter<'_> {
    type Item = (u128, i32);
    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let n = &self.tree.nodes[id as usize];
        let mut p = n.child[1];
        while p != NIL {
            self.stack.push(p);
            p = self.tree.nodes[p as usize].child[0];
        }
        Some((n.key, n.value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn check_balance(t: &DedupTree, id: u32) -> i32 {
        if id == NIL {
            return 0;
        }
        let n = &t.nodes[id as usize];
        let lh = check_balance(t, n.child[0]);
        let rh = check_balance(t, n.child[1]);
        assert_eq!((rh - lh) as i8, n.balance, "bad balance at {id}");
        assert!(n.balance.abs() <= 1);
        for c in n.child {
            if c != NIL {
                assert_eq!(t.nodes[c as usize].parent, id);
            }
        }
        1 + lh.max(rh)
    }

    #[test]
    fn insert_and_get() {
        let mut t = DedupTree::new();
        assert_eq!(t.insert(10, 0), None);
        assert_eq!(t.insert(5, 1), None);
        assert_eq!(t.insert(20, 2), None);
        assert_eq!(t.insert(10, 99), Some(0));
        assert_eq!(t.get(5), Some(1));
        assert_eq!(t.get(20), Some(2));
        assert_eq!(t.get(15), None);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn stays_balanced_on_sorted_input() {
        let mut t = DedupTree::new();
        for i in 0..1000 {
            assert_eq!(t.insert(i as u128, i), None);
        }
        let h = check_balance(&t, t.root);
        // AVL height bound: 1.44 log2(n)
        assert!(h <= 15, "height {h} too large for 1000 nodes");
        let keys: Vec<_> = t.iter().map(|(k, _)| k).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn random_inserts_match_btreemap() {
        use rand::prelude::*;
        use std::collections::BTreeMap;
        let mut rng = StdRng::seed_from_u64(17);
        let mut t = DedupTree::new();
        let mut reference = BTreeMap::new();
        for i in 0..5000i32 {
            let key = (rng.r#gen::<u64>() % 2000) as u128;
            let expected = reference.get(&key).copied();
            assert_eq!(t.insert(key, i), expected);
            reference.entry(key).or_insert(i);
        }
        check_balance(&t, t.root);
        assert_eq!(t.len(), reference.len());
        for (&k, &v) in &reference {
            assert_eq!(t.get(k), Some(v));
        }
    }
}
