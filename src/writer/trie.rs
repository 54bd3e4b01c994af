use std::mem;

use anyhow::bail;

use crate::dict::MAX_NODES;

// Tail bytes must stay above the range used for entry terminators and
// suffix lengths.
const MIN_TAIL_BYTE: u8 = 0x20;

#[derive(Debug, Default)]
struct BuildNode {
    label: Vec<u8>,
    children: Vec<usize>,
    key: Option<usize>,
}

/// A path-compressed trie in level order.
#[derive(Debug, Default)]
pub(crate) struct Trie {
    pub labels: Vec<Vec<u8>>,
    pub leaf: Vec<bool>,
    pub term: Vec<bool>,
    pub child: Vec<bool>,
    /// Index of the key ending at each node.
    pub key: Vec<Option<usize>>,
    /// First child of each node, 0 when it has none.
    pub first_child: Vec<u32>,
    /// First node of each node's sibling run.
    pub run_start: Vec<u32>,
}

impl Trie {
    /// Builds from keys in strictly ascending order.
    pub fn build<K: AsRef<[u8]>>(keys: &[K]) -> anyhow::Result<Self> {
        let mut arena = vec![BuildNode::default()];
        for (i, key) in keys.iter().enumerate() {
            let mut cur = 0;
            for &b in key.as_ref() {
                let last = arena[cur].children.last().copied();
                cur = match last {
                    Some(c) if arena[c].label[0] == b => c,
                    _ => {
                        arena.push(BuildNode {
                            label: vec![b],
                            ..Default::default()
                        });
                        let n = arena.len() - 1;
                        arena[cur].children.push(n);
                        n
                    }
                };
            }
            if cur == 0 || arena[cur].key.is_some() {
                bail!("key {} is empty or repeated", i);
            }
            arena[cur].key = Some(i);
        }

        compress(&mut arena);

        // Level order: each node's children form one run, and runs appear in
        // the order of their parents.
        let mut order: Vec<usize> = arena[0].children.clone();
        let mut i = 0;
        while i < order.len() {
            let children = arena[order[i]].children.clone();
            order.extend(children);
            i += 1;
        }
        if order.len() as u64 >= MAX_NODES as u64 {
            bail!("{} nodes exceeds the limit of {}", order.len(), MAX_NODES);
        }

        let mut id_of = vec![0_u32; arena.len()];
        for (id, &n) in order.iter().enumerate() {
            id_of[n] = id as u32;
        }

        let len = order.len();
        let mut t = Trie {
            labels: Vec::with_capacity(len),
            leaf: Vec::with_capacity(len),
            term: vec![false; len],
            child: Vec::with_capacity(len),
            key: Vec::with_capacity(len),
            first_child: vec![0; len],
            run_start: vec![0; len],
        };
        for &n in &order {
            let node = &mut arena[n];
            t.labels.push(mem::take(&mut node.label));
            t.leaf.push(node.key.is_some());
            t.child.push(!node.children.is_empty());
            t.key.push(node.key);
        }
        let mark_run = |t: &mut Trie, run: &[usize]| {
            if let (Some(&first), Some(&last)) = (run.first(), run.last()) {
                t.term[id_of[last] as usize] = true;
                for &c in run {
                    t.run_start[id_of[c] as usize] = id_of[first];
                }
            }
        };
        mark_run(&mut t, &arena[0].children);
        for &n in &order {
            mark_run(&mut t, &arena[n].children);
            if let Some(&c) = arena[n].children.first() {
                t.first_child[id_of[n] as usize] = id_of[c];
            }
        }
        Ok(t)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_ptr(&self, node_id: usize) -> bool {
        self.labels[node_id].len() > 1
    }
}

// Folds single-child chains into multi-byte tails. A node absorbs its only
// child while it does not end a key and both bytes can live in a tail.
fn compress(arena: &mut [BuildNode]) {
    let mut stack: Vec<usize> = arena[0].children.clone();
    while let Some(n) = stack.pop() {
        while arena[n].key.is_none()
            && arena[n].children.len() == 1
            && arena[n].label[0] >= MIN_TAIL_BYTE
            && arena[arena[n].children[0]].label[0] >= MIN_TAIL_BYTE
        {
            let c = arena[n].children[0];
            let child = mem::take(&mut arena[c]);
            let node = &mut arena[n];
            node.label.extend(child.label);
            node.children = child.children;
            node.key = child.key;
        }
        stack.extend(arena[n].children.iter().copied());
    }
}

#[cfg(test)]
mod test {
    use super::Trie;

    #[test]
    fn test_level_order_and_tails() {
        let t = Trie::build(&["car", "cat", "dog"]).unwrap();
        let labels: Vec<_> = t
            .labels
            .iter()
            .map(|l| String::from_utf8(l.clone()).unwrap())
            .collect();
        // "ca" is shared, then "r"/"t"; "dog" collapses into one tail.
        assert_eq!(labels, vec!["ca", "dog", "r", "t"]);
        assert_eq!(t.term, vec![false, true, false, true]);
        assert_eq!(t.child, vec![true, false, false, false]);
        assert_eq!(t.leaf, vec![false, true, true, true]);
        assert_eq!(t.key, vec![None, Some(2), Some(0), Some(1)]);
        assert_eq!(t.first_child, vec![2, 0, 0, 0]);
        assert_eq!(t.run_start, vec![0, 0, 2, 2]);
        assert!(t.is_ptr(0));
        assert!(!t.is_ptr(2));
    }

    #[test]
    fn test_prefix_keys_stop_compression() {
        let t = Trie::build(&["ab", "abcd"]).unwrap();
        let labels: Vec<&[u8]> = t.labels.iter().map(|l| l.as_slice()).collect();
        assert_eq!(labels, vec![&b"ab"[..], &b"cd"[..]]);
        assert!(t.leaf[0] && t.leaf[1]);
    }

    #[test]
    fn test_control_bytes_stay_literal() {
        let t = Trie::build(&[&b"a\x01bc"[..]]).unwrap();
        let labels: Vec<&[u8]> = t.labels.iter().map(|l| l.as_slice()).collect();
        assert_eq!(labels, vec![&b"a"[..], &b"\x01"[..], &b"bc"[..]]);
        assert!(Trie::build(&[&b"\x01\x02"[..]]).unwrap().labels.iter().all(|l| l.len() == 1));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Trie::build(&["a", "a"]).is_err());
        assert!(Trie::build(&[""]).is_err());
    }
}
