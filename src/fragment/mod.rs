use anyhow::{bail, Context};

use crate::{
    encoding::{read_u32, read_u64, slice},
    group::{GroupMap, MapKind},
};

pub const NODES_PER_BLOCK: u32 = 64;
pub const BYTES_PER_BLOCK: usize = 96;
pub const FRAGMENT_HEADER_LEN: usize = 8;

/// Node range owned by one fragment. `block_start` is the first node of the
/// first trie block stored for it and may precede `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub block_start: u32,
    pub end: u32,
}

impl Span {
    pub fn contains(&self, node_id: u32) -> bool {
        node_id >= self.start && node_id < self.end
    }

    pub fn block_count(&self) -> usize {
        ((self.end - self.block_start + NODES_PER_BLOCK - 1) / NODES_PER_BLOCK) as usize
    }
}

/// One 64-node trie block.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    pub first: u32,
    pub leaf: u64,
    pub term: u64,
    pub child: u64,
    pub ptr: u64,
    pub bytes: &'a [u8],
}

impl<'a> Block<'a> {
    pub fn parse(buf: &'a [u8], loc: usize, first: u32) -> anyhow::Result<Self> {
        Ok(Block {
            first,
            leaf: read_u64(buf, loc)?,
            term: read_u64(buf, loc + 8)?,
            child: read_u64(buf, loc + 16)?,
            ptr: read_u64(buf, loc + 24)?,
            bytes: slice(buf, loc + 32, NODES_PER_BLOCK as usize)?,
        })
    }

    #[inline]
    fn mask(&self, node_id: u32) -> u64 {
        1 << ((node_id - self.first) % NODES_PER_BLOCK)
    }

    #[inline]
    pub fn is_leaf(&self, node_id: u32) -> bool {
        self.leaf & self.mask(node_id) != 0
    }

    #[inline]
    pub fn is_term(&self, node_id: u32) -> bool {
        self.term & self.mask(node_id) != 0
    }

    #[inline]
    pub fn has_child(&self, node_id: u32) -> bool {
        self.child & self.mask(node_id) != 0
    }

    #[inline]
    pub fn is_ptr(&self, node_id: u32) -> bool {
        self.ptr & self.mask(node_id) != 0
    }

    #[inline]
    pub fn byte(&self, node_id: u32) -> u8 {
        self.bytes[((node_id - self.first) % NODES_PER_BLOCK) as usize]
    }
}

#[derive(Debug)]
pub struct Fragment {
    pub id: usize,
    pub span: Span,
    trie_loc: usize,
    tail_map: GroupMap,
    // Index 0 is the main value column.
    val_maps: Vec<Option<GroupMap>>,
}

impl Fragment {
    /// Parses the fragment stored at `loc` in the primary buffer. `columns`
    /// holds the value-buffer location (+1, 0 = none) of each auxiliary
    /// column for this fragment.
    pub fn parse(
        id: usize,
        dict: &[u8],
        vals: Option<&[u8]>,
        loc: usize,
        span: Span,
        columns: &[u32],
    ) -> anyhow::Result<Self> {
        if span.block_start % NODES_PER_BLOCK != 0
            || span.block_start > span.start
            || span.start >= span.end
            || span.start - span.block_start >= NODES_PER_BLOCK
        {
            bail!("fragment {} has invalid node range {:?}", id, span);
        }

        let tail_size = read_u32(dict, loc)? as usize;
        let val_fp = read_u32(dict, loc + 4)?;
        let tails_loc = loc + FRAGMENT_HEADER_LEN;
        let trie_loc = tails_loc + tail_size;
        slice(dict, trie_loc, span.block_count() * BYTES_PER_BLOCK)
            .with_context(|| format!("trie region of fragment {}", id))?;

        let tail_map = GroupMap::parse(dict, tails_loc, span, MapKind::Tail)
            .with_context(|| format!("tail map of fragment {}", id))?;

        let mut val_maps = Vec::with_capacity(columns.len() + 1);
        for (col, fp) in std::iter::once(val_fp).chain(columns.iter().copied()).enumerate() {
            if fp == 0 {
                val_maps.push(None);
                continue;
            }
            let vals = match vals {
                Some(v) => v,
                None => bail!("fragment {} column {} needs a value buffer", id, col),
            };
            let map = GroupMap::parse(vals, fp as usize - 1, span, MapKind::Value)
                .with_context(|| format!("value map of fragment {} column {}", id, col))?;
            val_maps.push(Some(map));
        }

        Ok(Fragment {
            id,
            span,
            trie_loc,
            tail_map,
            val_maps,
        })
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.span.contains(node_id)
    }

    pub fn block_loc(&self, node_id: u32) -> usize {
        self.trie_loc
            + ((node_id - self.span.block_start) / NODES_PER_BLOCK) as usize * BYTES_PER_BLOCK
    }

    /// Byte offset of a node's stored byte in the primary buffer.
    pub fn node_byte_loc(&self, node_id: u32) -> usize {
        self.block_loc(node_id) + 32 + (node_id % NODES_PER_BLOCK) as usize
    }

    pub fn block<'a>(&self, dict: &'a [u8], node_id: u32) -> anyhow::Result<Block<'a>> {
        if !self.contains(node_id) {
            bail!("node {} is not in fragment {}", node_id, self.id);
        }
        let first = node_id - node_id % NODES_PER_BLOCK;
        Block::parse(dict, self.block_loc(node_id), first)
    }

    pub fn tail_map(&self) -> &GroupMap {
        &self.tail_map
    }

    /// Value map of `column`; `None` when the column has no data in this
    /// fragment.
    pub fn value_map(&self, column: usize) -> anyhow::Result<Option<&GroupMap>> {
        match self.val_maps.get(column) {
            Some(m) => Ok(m.as_ref()),
            None => bail!("column {} out of range ({} columns)", column, self.val_maps.len()),
        }
    }
}
