// Rank and select over the trie's bit-vectors.
//
// The term and child vectors share one index of 12-byte entries per 256
// nodes; the leaf vector has its own 8-byte entries. Each entry holds the
// number of set bits before its block plus cumulative counts at the end of
// the first three 64-node sub-blocks. The remaining bits come from the
// words stored in the trie blocks themselves.

use anyhow::{anyhow, bail};

use super::StaticDict;
use crate::{
    encoding::{rank64, read_u24, read_u32, read_u8, select64},
    fragment::NODES_PER_BLOCK,
};

pub const NODES_PER_BV_BLOCK: u32 = 256;
pub const TRIE_BV_ENTRY_LEN: usize = 12;
pub const LEAF_BV_ENTRY_LEN: usize = 8;
pub const TERMS_PER_SELECT: u32 = 512;

// Beyond this many candidate blocks, select binary searches.
const LINEAR_SCAN_BLOCKS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bits {
    Leaf,
    Term,
    Child,
}

impl StaticDict {
    pub(crate) fn bv_block_count(&self) -> u32 {
        (self.header.node_count + NODES_PER_BV_BLOCK - 1) / NODES_PER_BV_BLOCK
    }

    // Set bits before 256-node block `blk`, and the cumulative minis.
    pub(crate) fn counts(&self, bits: Bits, blk: u32) -> anyhow::Result<(u32, [u8; 3])> {
        let buf = &self.trie[..];
        match bits {
            Bits::Leaf => {
                let loc = self.header.leaf_bv_loc as usize + blk as usize * LEAF_BV_ENTRY_LEN;
                Ok((
                    read_u32(buf, loc)?,
                    [read_u8(buf, loc + 4)?, read_u8(buf, loc + 5)?, read_u8(buf, loc + 6)?],
                ))
            }
            Bits::Term | Bits::Child => {
                let loc = self.header.trie_bv_loc as usize + blk as usize * TRIE_BV_ENTRY_LEN;
                let (rank_at, mini_at) = if bits == Bits::Term { (0, 6) } else { (3, 9) };
                Ok((
                    read_u24(buf, loc + rank_at)?,
                    [
                        read_u8(buf, loc + mini_at)?,
                        read_u8(buf, loc + mini_at + 1)?,
                        read_u8(buf, loc + mini_at + 2)?,
                    ],
                ))
            }
        }
    }

    fn word(&self, bits: Bits, node_id: u32, hint: &mut usize) -> anyhow::Result<u64> {
        let frag = self.which_fragment(node_id, hint)?;
        let block = frag.block(&self.trie, node_id)?;
        Ok(match bits {
            Bits::Leaf => block.leaf,
            Bits::Term => block.term,
            Bits::Child => block.child,
        })
    }

    /// Number of set bits strictly before `node_id`.
    pub(crate) fn rank(&self, bits: Bits, node_id: u32, hint: &mut usize) -> anyhow::Result<u32> {
        if node_id >= self.header.node_count {
            bail!("rank of node {} past node count {}", node_id, self.header.node_count);
        }
        let (mut r, minis) = self.counts(bits, node_id / NODES_PER_BV_BLOCK)?;
        let sub = (node_id / NODES_PER_BLOCK) % 4;
        if sub > 0 {
            r += minis[sub as usize - 1] as u32;
        }
        let word = self.word(bits, node_id, hint)?;
        Ok(r + rank64(word, node_id % NODES_PER_BLOCK))
    }

    // Candidate 256-node blocks for the 1-based term bit `r`.
    fn term_select_range(&self, r: u32) -> anyhow::Result<(u32, u32)> {
        let buf = &self.trie[..];
        let j = (r / TERMS_PER_SELECT) as usize;
        let loc = self.header.select_loc as usize + j * 3;
        let lo = read_u24(buf, loc)?;
        let hi = read_u24(buf, loc + 3)?;
        if lo > hi || hi >= self.bv_block_count() {
            bail!("select index entry {} is out of range ({}..{})", j, lo, hi);
        }
        Ok((lo, hi))
    }

    /// Position of the `r`-th (1-based) set bit.
    pub(crate) fn select(&self, bits: Bits, r: u32, hint: &mut usize) -> anyhow::Result<u32> {
        let blocks = self.bv_block_count();
        if r == 0 || blocks == 0 {
            bail!("select of bit {} in {} blocks", r, blocks);
        }
        let (mut lo, mut hi) = match bits {
            Bits::Term => self.term_select_range(r)?,
            _ => (0, blocks - 1),
        };

        // Last block whose preceding count is below r.
        if hi - lo <= LINEAR_SCAN_BLOCKS {
            while lo < hi && self.counts(bits, lo + 1)?.0 < r {
                lo += 1;
            }
        } else {
            while lo < hi {
                let mid = lo + (hi - lo + 1) / 2;
                if self.counts(bits, mid)?.0 < r {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
        }

        let (base, minis) = self.counts(bits, lo)?;
        if base >= r {
            bail!("{:?} bit {} precedes block {}", bits, r, lo);
        }
        let rem = r - base;
        let mut sub = 0;
        while sub < 3 && (minis[sub] as u32) < rem {
            sub += 1;
        }
        let before = if sub > 0 { minis[sub - 1] as u32 } else { 0 };
        let first = lo * NODES_PER_BV_BLOCK + sub as u32 * NODES_PER_BLOCK;
        if first >= self.header.node_count || rem <= before {
            bail!("{:?} bit {} is past the last node", bits, r);
        }
        let word = self.word(bits, first, hint)?;
        let pos = select64(word, rem - before - 1)
            .ok_or_else(|| anyhow!("{:?} bit {} missing from block at {}", bits, r, first))?;
        Ok(first + pos)
    }

    /// First node of the children run of the node holding the `r`-th child
    /// bit.
    pub(crate) fn find_child(&self, r: u32, hint: &mut usize) -> anyhow::Result<u32> {
        let child = self.select(Bits::Term, r, hint)? + 1;
        if child >= self.header.node_count {
            bail!("child run {} starts past the last node", r);
        }
        Ok(child)
    }

    /// Parent of `node_id`, or None for nodes in the root run.
    pub(crate) fn parent(&self, node_id: u32, hint: &mut usize) -> anyhow::Result<Option<u32>> {
        match self.rank(Bits::Term, node_id, hint)? {
            0 => Ok(None),
            r => self.select(Bits::Child, r, hint).map(Some),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Bits;
    use crate::writer::{DictWriter, WriterOptions};

    // Recomputes every rank and select by walking the blocks directly.
    #[test]
    fn test_rank_select_against_scan() {
        let mut keys: Vec<String> = (0..3000).map(|i| format!("k{:05}/{}", i * 7919 % 100_000, i % 13)).collect();
        keys.sort();
        keys.dedup();
        let opts = WriterOptions {
            nodes_per_fragment: 300,
            ..Default::default()
        };
        let mut w = DictWriter::new(opts);
        for k in &keys {
            w.add(k.as_bytes(), b"").unwrap();
        }
        let dict = w.finish_dict().unwrap();

        for bits in [Bits::Leaf, Bits::Term, Bits::Child] {
            let mut hint = 0;
            let mut seen = 0;
            for n in 0..dict.header.node_count {
                assert_eq!(dict.rank(bits, n, &mut hint).unwrap(), seen, "{:?} rank {}", bits, n);
                let frag = dict.which_fragment(n, &mut hint).unwrap();
                let block = frag.block(&dict.trie, n).unwrap();
                let set = match bits {
                    Bits::Leaf => block.is_leaf(n),
                    Bits::Term => block.is_term(n),
                    Bits::Child => block.has_child(n),
                };
                if set {
                    seen += 1;
                    assert_eq!(dict.select(bits, seen, &mut hint).unwrap(), n, "{:?} select {}", bits, seen);
                }
            }
            assert!(dict.select(bits, seen + 1, &mut hint).is_err());
            assert!(dict.select(bits, 0, &mut hint).is_err());
            if bits == Bits::Leaf {
                assert_eq!(seen as usize, keys.len());
            }
        }
    }
}
