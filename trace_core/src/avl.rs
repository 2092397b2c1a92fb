//! Height-balanced binary tree with explicit balance tags.
//!
//! Each node records which subtree is taller (`Skew`) instead of a height.
//! Insert and remove recurse down the tree and report back whether the
//! subtree they touched changed height (`Signal::Balance`), letting each
//! ancestor fix itself with at most one single or double rotation.

use std::cmp::Ordering;
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skew {
    Left,
    Equal,
    Right,
}

/// Whether the subtree below changed height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Ok,
    Balance,
}

type Link<K, V> = Option<Box<Node<K, V>>>;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    left: Link<K, V>,
    right: Link<K, V>,
    skew: Skew,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Box<Self> {
        Box::new(Node {
            key,
            value,
            left: None,
            right: None,
            skew: Skew::Equal,
        })
    }
}

#[derive(Debug)]
pub struct AvlTree<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K, V> Default for AvlTree<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<K: Ord, V> AvlTree<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a new key. A key already present is handed back untouched;
    /// callers check with `get` first when they care.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), (K, V)> {
        insert_at(&mut self.root, key, value)?;
        self.len += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, _) = remove_at(&mut self.root, key)?;
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = &self.root;
        while let Some(node) = link {
            link = match key.cmp(&node.key) {
                Ordering::Less => &node.left,
                Ordering::Greater => &node.right,
                Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut link = &mut self.root;
        while let Some(node) = link {
            match key.cmp(&node.key) {
                Ordering::Less => link = &mut node.left,
                Ordering::Greater => link = &mut node.right,
                Ordering::Equal => return Some(&mut node.value),
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn lowest(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(left) = node.left.as_deref() {
            node = left;
        }
        Some((&node.key, &node.value))
    }

    pub fn highest(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(right) = node.right.as_deref() {
            node = right;
        }
        Some((&node.key, &node.value))
    }

    /// In-order (ascending key) traversal.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    pub fn height(&self) -> usize {
        height(&self.root)
    }

    /// Walks the whole tree checking ordering, the height rule and that each
    /// skew tag matches the real subtree heights.
    pub fn check_invariants(&self) -> Result<(), String> {
        check(&self.root).map(|_| ())?;
        let keys: Vec<&K> = self.iter().map(|(k, _)| k).collect();
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err("in-order keys are not strictly increasing".to_string());
        }
        if keys.len() != self.len {
            return Err(format!("len {} but {} nodes", self.len, keys.len()));
        }
        Ok(())
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left(&mut self, mut node: Option<&'a Node<K, V>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}

fn height<K, V>(link: &Link<K, V>) -> usize {
    match link {
        None => 0,
        Some(node) => 1 + height(&node.left).max(height(&node.right)),
    }
}

fn check<K, V>(link: &Link<K, V>) -> Result<usize, String> {
    let node = match link {
        None => return Ok(0),
        Some(node) => node,
    };
    let left = check(&node.left)?;
    let right = check(&node.right)?;
    let expected = match left.cmp(&right) {
        Ordering::Greater => Skew::Left,
        Ordering::Less => Skew::Right,
        Ordering::Equal => Skew::Equal,
    };
    if left.abs_diff(right) > 1 {
        return Err(format!("subtree heights {} and {}", left, right));
    }
    if node.skew != expected {
        return Err(format!("skew {:?} but heights {} and {}", node.skew, left, right));
    }
    Ok(1 + left.max(right))
}

fn rot_left<K, V>(root: &mut Box<Node<K, V>>) {
    if let Some(mut pivot) = root.right.take() {
        root.right = pivot.left.take();
        mem::swap(root, &mut pivot);
        root.left = Some(pivot);
    }
}

fn rot_right<K, V>(root: &mut Box<Node<K, V>>) {
    if let Some(mut pivot) = root.left.take() {
        root.left = pivot.right.take();
        mem::swap(root, &mut pivot);
        root.right = Some(pivot);
    }
}

fn insert_at<K: Ord, V>(link: &mut Link<K, V>, key: K, value: V) -> Result<Signal, (K, V)> {
    let node = match link {
        None => {
            *link = Some(Node::new(key, value));
            return Ok(Signal::Balance);
        }
        Some(node) => node,
    };
    match key.cmp(&node.key) {
        Ordering::Less => match insert_at(&mut node.left, key, value)? {
            Signal::Balance => Ok(left_grown(node)),
            Signal::Ok => Ok(Signal::Ok),
        },
        Ordering::Greater => match insert_at(&mut node.right, key, value)? {
            Signal::Balance => Ok(right_grown(node)),
            Signal::Ok => Ok(Signal::Ok),
        },
        Ordering::Equal => Err((key, value)),
    }
}

/// Skews of the outer pair after a double rotation, indexed by the skew of
/// the grandchild that becomes the new root.
fn double_rotation_skews(grandchild: Skew) -> (Skew, Skew) {
    match grandchild {
        Skew::Left => (Skew::Equal, Skew::Right),
        Skew::Right => (Skew::Left, Skew::Equal),
        Skew::Equal => (Skew::Equal, Skew::Equal),
    }
}

/// Left subtree of `node` rotated right then `node` rotated left happens in
/// `right_grown`; this is the mirror for a taller left side.
fn rotate_left_right<K, V>(node: &mut Box<Node<K, V>>) {
    if let Some(left) = node.left.as_mut() {
        let grandchild = left.right.as_ref().map_or(Skew::Equal, |g| g.skew);
        let (new_left, new_right) = double_rotation_skews(grandchild);
        left.skew = new_left;
        node.skew = new_right;
        if let Some(g) = left.right.as_mut() {
            g.skew = Skew::Equal;
        }
        rot_left(left);
    }
    rot_right(node);
}

fn rotate_right_left<K, V>(node: &mut Box<Node<K, V>>) {
    if let Some(right) = node.right.as_mut() {
        let grandchild = right.left.as_ref().map_or(Skew::Equal, |g| g.skew);
        let (new_left, new_right) = double_rotation_skews(grandchild);
        node.skew = new_left;
        right.skew = new_right;
        if let Some(g) = right.left.as_mut() {
            g.skew = Skew::Equal;
        }
        rot_right(right);
    }
    rot_left(node);
}

fn left_grown<K, V>(node: &mut Box<Node<K, V>>) -> Signal {
    match node.skew {
        Skew::Left => {
            let left_skew = node.left.as_ref().map_or(Skew::Equal, |l| l.skew);
            if left_skew == Skew::Left {
                node.skew = Skew::Equal;
                if let Some(left) = node.left.as_mut() {
                    left.skew = Skew::Equal;
                }
                rot_right(node);
            } else {
                rotate_left_right(node);
            }
            Signal::Ok
        }
        Skew::Right => {
            node.skew = Skew::Equal;
            Signal::Ok
        }
        Skew::Equal => {
            node.skew = Skew::Left;
            Signal::Balance
        }
    }
}

fn right_grown<K, V>(node: &mut Box<Node<K, V>>) -> Signal {
    match node.skew {
        Skew::Right => {
            let right_skew = node.right.as_ref().map_or(Skew::Equal, |r| r.skew);
            if right_skew == Skew::Right {
                node.skew = Skew::Equal;
                if let Some(right) = node.right.as_mut() {
                    right.skew = Skew::Equal;
                }
                rot_left(node);
            } else {
                rotate_right_left(node);
            }
            Signal::Ok
        }
        Skew::Left => {
            node.skew = Skew::Equal;
            Signal::Ok
        }
        Skew::Equal => {
            node.skew = Skew::Right;
            Signal::Balance
        }
    }
}

fn left_shrunk<K, V>(node: &mut Box<Node<K, V>>) -> Signal {
    match node.skew {
        Skew::Left => {
            node.skew = Skew::Equal;
            Signal::Balance
        }
        Skew::Equal => {
            node.skew = Skew::Right;
            Signal::Ok
        }
        Skew::Right => {
            let right_skew = node.right.as_ref().map_or(Skew::Equal, |r| r.skew);
            match right_skew {
                Skew::Right => {
                    node.skew = Skew::Equal;
                    if let Some(right) = node.right.as_mut() {
                        right.skew = Skew::Equal;
                    }
                    rot_left(node);
                    Signal::Balance
                }
                Skew::Equal => {
                    node.skew = Skew::Right;
                    if let Some(right) = node.right.as_mut() {
                        right.skew = Skew::Left;
                    }
                    rot_left(node);
                    Signal::Ok
                }
                Skew::Left => {
                    rotate_right_left(node);
                    Signal::Balance
                }
            }
        }
    }
}

fn right_shrunk<K, V>(node: &mut Box<Node<K, V>>) -> Signal {
    match node.skew {
        Skew::Right => {
            node.skew = Skew::Equal;
            Signal::Balance
        }
        Skew::Equal => {
            node.skew = Skew::Left;
            Signal::Ok
        }
        Skew::Left => {
            let left_skew = node.left.as_ref().map_or(Skew::Equal, |l| l.skew);
            match left_skew {
                Skew::Left => {
                    node.skew = Skew::Equal;
                    if let Some(left) = node.left.as_mut() {
                        left.skew = Skew::Equal;
                    }
                    rot_right(node);
                    Signal::Balance
                }
                Skew::Equal => {
                    node.skew = Skew::Left;
                    if let Some(left) = node.left.as_mut() {
                        left.skew = Skew::Right;
                    }
                    rot_right(node);
                    Signal::Ok
                }
                Skew::Right => {
                    rotate_left_right(node);
                    Signal::Balance
                }
            }
        }
    }
}

/// Unlinks the highest node below `link`.
fn take_highest<K, V>(link: &mut Link<K, V>) -> Option<(K, V, Signal)> {
    let node = link.as_mut()?;
    if node.right.is_some() {
        let (key, value, signal) = take_highest(&mut node.right)?;
        let signal = match signal {
            Signal::Balance => right_shrunk(node),
            Signal::Ok => Signal::Ok,
        };
        return Some((key, value, signal));
    }
    let mut node = link.take()?;
    *link = node.left.take();
    let Node { key, value, .. } = *node;
    Some((key, value, Signal::Balance))
}

/// Unlinks the lowest node below `link`.
fn take_lowest<K, V>(link: &mut Link<K, V>) -> Option<(K, V, Signal)> {
    let node = link.as_mut()?;
    if node.left.is_some() {
        let (key, value, signal) = take_lowest(&mut node.left)?;
        let signal = match signal {
            Signal::Balance => left_shrunk(node),
            Signal::Ok => Signal::Ok,
        };
        return Some((key, value, signal));
    }
    let mut node = link.take()?;
    *link = node.right.take();
    let Node { key, value, .. } = *node;
    Some((key, value, Signal::Balance))
}

fn remove_at<K: Ord, V>(link: &mut Link<K, V>, key: &K) -> Option<(V, Signal)> {
    let node = link.as_mut()?;
    match key.cmp(&node.key) {
        Ordering::Less => {
            let (value, signal) = remove_at(&mut node.left, key)?;
            let signal = match signal {
                Signal::Balance => left_shrunk(node),
                Signal::Ok => Signal::Ok,
            };
            Some((value, signal))
        }
        Ordering::Greater => {
            let (value, signal) = remove_at(&mut node.right, key)?;
            let signal = match signal {
                Signal::Balance => right_shrunk(node),
                Signal::Ok => Signal::Ok,
            };
            Some((value, signal))
        }
        Ordering::Equal => {
            // 用左子树最大节点替换, 没有左子树时用右子树最小节点
            if node.left.is_some() {
                let (k, v, signal) = take_highest(&mut node.left)?;
                node.key = k;
                let value = mem::replace(&mut node.value, v);
                let signal = match signal {
                    Signal::Balance => left_shrunk(node),
                    Signal::Ok => Signal::Ok,
                };
                Some((value, signal))
            } else if node.right.is_some() {
                let (k, v, signal) = take_lowest(&mut node.right)?;
                node.key = k;
                let value = mem::replace(&mut node.value, v);
                let signal = match signal {
                    Signal::Balance => right_shrunk(node),
                    Signal::Ok => Signal::Ok,
                };
                Some((value, signal))
            } else {
                let node = link.take()?;
                Some((node.value, Signal::Balance))
            }
        }
    }
}
