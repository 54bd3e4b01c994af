use std::path::Path;

use anyhow::{anyhow, bail, Context};

use crate::{
    buffer::ByteBuf,
    config::DictOptions,
    encoding::{compare, read_u32, slice},
    fragment::{Block, Fragment, Span, NODES_PER_BLOCK},
    fs::{value_path, Buffer},
    group::TailScratch,
};

pub use header::{Header, HEADER_LEN, MAX_NODES};
pub use iter::{Iter, IterCtx};

use cache::Probe;
use rank::{Bits, LEAF_BV_ENTRY_LEN, TERMS_PER_SELECT, TRIE_BV_ENTRY_LEN};

pub(crate) mod cache;
mod header;
mod iter;
pub(crate) mod rank;

pub const FRAGMENT_ENTRY_LEN: usize = 12;

/// Why a lookup stopped, phrased as where the key would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    /// The key sorts after the last sibling of the run.
    InsertAfter,
    /// The key sorts before the node it stopped at.
    InsertBefore,
    /// The key continues past a node that has no children.
    InsertChildLeaf,
    /// The key ends exactly at a node that does not end a key.
    InsertLeaf,
    /// The key diverges from, or ends inside, the node's tail.
    InsertThread,
    /// Empty dictionary, empty key, or a key longer than any stored.
    InsertEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Miss {
    pub kind: MissKind,
    pub node_id: u32,
    pub key_pos: usize,
    /// Offset in the primary buffer of the node byte where the walk stopped.
    pub exit_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(u32),
    Miss(Miss),
}

impl Lookup {
    pub fn node_id(&self) -> Option<u32> {
        match self {
            Lookup::Found(n) => Some(*n),
            Lookup::Miss(_) => None,
        }
    }
}

/// A read-only dictionary over a primary buffer (trie, tails, indices) and
/// an optional value buffer.
#[derive(Debug)]
pub struct StaticDict {
    trie: Buffer,
    vals: Option<Buffer>,
    header: Header,
    fragments: Vec<Fragment>,
    tail_cap: usize,
}

// Reads blocks for a walk that mostly moves forward through node ids,
// re-reading only when the walk leaves the current block or fragment.
pub(crate) struct Nodes<'a> {
    dict: &'a StaticDict,
    hint: usize,
    cur: Option<(usize, Block<'a>)>,
}

impl<'a> Nodes<'a> {
    pub(crate) fn new(dict: &'a StaticDict) -> Self {
        Nodes {
            dict,
            hint: 0,
            cur: None,
        }
    }

    pub(crate) fn at(&mut self, node_id: u32) -> anyhow::Result<(&'a Fragment, Block<'a>)> {
        let dict: &'a StaticDict = self.dict;
        if let Some((f, block)) = self.cur {
            let frag = &dict.fragments[f];
            if frag.contains(node_id) && node_id / NODES_PER_BLOCK == block.first / NODES_PER_BLOCK {
                return Ok((frag, block));
            }
        }
        let frag = dict.which_fragment(node_id, &mut self.hint)?;
        let block = frag.block(&dict.trie, node_id)?;
        self.cur = Some((frag.id, block));
        Ok((frag, block))
    }

    pub(crate) fn hint(&mut self) -> &mut usize {
        &mut self.hint
    }
}

impl StaticDict {
    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::load_with(path, DictOptions::default())
    }

    /// Opens the dictionary at `path` and its value buffer at `<path>.val`.
    pub fn load_with<P>(path: P, opts: DictOptions) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let trie = Buffer::open(path, &opts)?;
        let vals = Buffer::open_optional(value_path(path), &opts)?;
        if opts.prefetch && trie.is_mapped() {
            trie.prefetch(trie.len() / 4);
        }
        Self::from_buffers(trie, vals, &opts)
            .with_context(|| format!("loading dictionary {}", path.display()))
    }

    pub fn from_buffers(
        trie: Buffer,
        vals: Option<Buffer>,
        opts: &DictOptions,
    ) -> anyhow::Result<Self> {
        let header = Header::parse(&trie)?;
        if header.max_tail_len as usize > trie.len() {
            bail!("longest tail of {} bytes exceeds the buffer", header.max_tail_len);
        }
        let fragments = Self::parse_fragments(&header, &trie, vals.as_deref())?;

        let blocks = (header.node_count as usize + 255) / 256;
        slice(&trie, header.trie_bv_loc as usize, (blocks + 1) * TRIE_BV_ENTRY_LEN)
            .context("trie bit-vector index")?;
        slice(&trie, header.leaf_bv_loc as usize, (blocks + 1) * LEAF_BV_ENTRY_LEN)
            .context("leaf bit-vector index")?;
        if header.cache_count > 0 {
            slice(
                &trie,
                header.cache_loc as usize,
                header.cache_count as usize * cache::CACHE_ENTRY_LEN,
            )
            .context("front cache")?;
        }

        let dict = StaticDict {
            tail_cap: header.max_tail_len as usize + 1,
            trie,
            vals,
            header,
            fragments,
        };
        if dict.header.node_count > 0 {
            let terms = dict.counts_total(Bits::Term)?;
            let leaves = dict.counts_total(Bits::Leaf)?;
            if leaves != dict.header.key_count {
                bail!("{} leaves but {} keys", leaves, dict.header.key_count);
            }
            let entries = (terms + TERMS_PER_SELECT - 1) / TERMS_PER_SELECT + 2;
            slice(&dict.trie, dict.header.select_loc as usize, entries as usize * 3)
                .context("select index")?;
        }

        tracing::debug!(
            nodes = dict.header.node_count,
            fragments = dict.fragments.len(),
            mapped = dict.trie.is_mapped(),
            "parsed dictionary"
        );
        if opts.verbose {
            tracing::info!(
                keys = dict.header.key_count,
                nodes = dict.header.node_count,
                fragments = dict.fragments.len(),
                columns = dict.header.aux_column_count,
                max_key_len = dict.header.max_key_len,
                max_val_len = dict.header.max_val_len,
                cache = dict.header.cache_count,
                "loaded dictionary"
            );
        }
        Ok(dict)
    }

    fn parse_fragments(
        header: &Header,
        trie: &[u8],
        vals: Option<&[u8]>,
    ) -> anyhow::Result<Vec<Fragment>> {
        let count = header.fragment_count as usize;
        let aux = header.aux_column_count as usize;
        slice(trie, header.column_table_loc as usize, aux * count * 4).context("column table")?;
        let mut fragments = Vec::with_capacity(count);
        let mut start = 0;
        for i in 0..count {
            let loc = header.fragment_table_loc as usize + i * FRAGMENT_ENTRY_LEN;
            let offset = read_u32(trie, loc)? as usize;
            let span = Span {
                start,
                block_start: read_u32(trie, loc + 4)?,
                end: read_u32(trie, loc + 8)?,
            };
            let mut columns = Vec::with_capacity(aux);
            for c in 0..aux {
                let at = header.column_table_loc as usize + (c * count + i) * 4;
                columns.push(read_u32(trie, at)?);
            }
            fragments.push(Fragment::parse(i, trie, vals, offset, span, &columns)?);
            start = span.end;
        }
        if start != header.node_count {
            bail!("fragments cover {} of {} nodes", start, header.node_count);
        }
        Ok(fragments)
    }

    fn counts_total(&self, bits: Bits) -> anyhow::Result<u32> {
        Ok(self.counts(bits, self.bv_block_count())?.0)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn key_count(&self) -> u32 {
        self.header.key_count
    }

    pub fn max_key_len(&self) -> usize {
        self.header.max_key_len as usize
    }

    pub fn max_val_len(&self) -> usize {
        self.header.max_val_len as usize
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Fragment owning `node_id`, searching forward from `*hint`.
    pub fn which_fragment(&self, node_id: u32, hint: &mut usize) -> anyhow::Result<&Fragment> {
        let mut i = match self.fragments.get(*hint) {
            Some(f) if f.span.start <= node_id => *hint,
            _ => 0,
        };
        while let Some(f) = self.fragments.get(i) {
            if f.contains(node_id) {
                *hint = i;
                return Ok(f);
            }
            if f.span.start > node_id {
                break;
            }
            i += 1;
        }
        Err(anyhow!("no fragment holds node {}", node_id))
    }

    fn tail_bufs(&self) -> (ByteBuf, TailScratch) {
        (ByteBuf::with_max_len(self.tail_cap), TailScratch::new(self.tail_cap))
    }

    pub fn lookup(&self, key: &[u8]) -> anyhow::Result<Option<u32>> {
        Ok(self.lookup_detailed(key)?.node_id())
    }

    /// Finds the node terminating `key`, or describes where the walk
    /// stopped.
    pub fn lookup_detailed(&self, key: &[u8]) -> anyhow::Result<Lookup> {
        let miss = |kind, node_id, key_pos, exit_offset| {
            Ok(Lookup::Miss(Miss {
                kind,
                node_id,
                key_pos,
                exit_offset,
            }))
        };
        if key.is_empty() || key.len() > self.max_key_len() || self.header.node_count == 0 {
            return miss(MissKind::InsertEmpty, 0, 0, 0);
        }

        let buf = &self.trie[..];
        let (mut tail, mut scratch) = self.tail_bufs();
        let mut nodes = Nodes::new(self);
        let mut key_pos = 0;
        let mut node_id = 0;

        loop {
            match self.probe_cache(key, &mut key_pos, &mut node_id, nodes.hint())? {
                Probe::Miss => {}
                Probe::Found(n) => return Ok(Lookup::Found(n)),
                Probe::NotLeaf(n) => {
                    let frag = self.which_fragment(n, nodes.hint())?;
                    return miss(MissKind::InsertLeaf, n, key_pos, frag.node_byte_loc(n));
                }
                Probe::NoChild(n) => {
                    let frag = self.which_fragment(n, nodes.hint())?;
                    return miss(MissKind::InsertChildLeaf, n, key_pos, frag.node_byte_loc(n));
                }
            }

            let mut child_count = self.rank(Bits::Child, node_id, nodes.hint())?;
            let key_byte = key[key_pos];
            let mut cursor = None;

            // Scan the run for the first node whose byte is not below the
            // key byte.
            let (frag, block, trie_byte) = loop {
                if node_id >= self.header.node_count {
                    bail!("sibling run runs past the last node at {}", node_id);
                }
                let (frag, block) = nodes.at(node_id)?;
                let trie_byte = frag
                    .tail_map()
                    .node_first_byte(buf, &block, node_id, &mut cursor)?;
                if block.has_child(node_id) {
                    child_count += 1;
                }
                if key_byte > trie_byte {
                    if block.is_term(node_id) {
                        return miss(
                            MissKind::InsertAfter,
                            node_id,
                            key_pos,
                            frag.node_byte_loc(node_id),
                        );
                    }
                    node_id += 1;
                    continue;
                }
                break (frag, block, trie_byte);
            };
            let exit = frag.node_byte_loc(node_id);
            if key_byte < trie_byte {
                return miss(MissKind::InsertBefore, node_id, key_pos, exit);
            }

            frag.tail_map()
                .node_tail(buf, &block, node_id, &mut tail, &mut scratch)?;
            if tail.is_empty() {
                bail!("node {} has an empty tail", node_id);
            }
            let rest = &key[key_pos..];
            let cmp = compare(&tail, rest);
            if cmp == 0 {
                if block.is_leaf(node_id) {
                    return Ok(Lookup::Found(node_id));
                }
                return miss(MissKind::InsertLeaf, node_id, key_pos, exit);
            }
            if cmp != tail.len() + 1 {
                return miss(MissKind::InsertThread, node_id, key_pos, exit);
            }
            key_pos += tail.len();
            if !block.has_child(node_id) {
                return miss(MissKind::InsertChildLeaf, node_id, key_pos, exit);
            }
            node_id = self.find_child(child_count, nodes.hint())?;
        }
    }

    /// Value of `key`, or None if the key is absent.
    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        Ok(self.get_into(key, &mut out)?.then_some(out))
    }

    /// Like [StaticDict::get] but decodes into a caller-owned buffer.
    pub fn get_into(&self, key: &[u8], out: &mut Vec<u8>) -> anyhow::Result<bool> {
        match self.lookup(key)? {
            Some(node_id) => {
                let mut nodes = Nodes::new(self);
                self.col_val_into(&mut nodes, node_id, 0, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Value of `column` for the key ending at `node_id`. Column 0 is the
    /// main value. None when the node does not end a key.
    pub fn get_col_val(&self, node_id: u32, column: usize) -> anyhow::Result<Option<Vec<u8>>> {
        if node_id >= self.header.node_count {
            return Ok(None);
        }
        let mut nodes = Nodes::new(self);
        let (_, block) = nodes.at(node_id)?;
        if !block.is_leaf(node_id) {
            return Ok(None);
        }
        let mut out = Vec::new();
        self.col_val_into(&mut nodes, node_id, column, &mut out)?;
        Ok(Some(out))
    }

    pub(crate) fn col_val_into(
        &self,
        nodes: &mut Nodes,
        node_id: u32,
        column: usize,
        out: &mut Vec<u8>,
    ) -> anyhow::Result<()> {
        let (frag, block) = nodes.at(node_id)?;
        match frag.value_map(column)? {
            Some(map) => {
                let vals = self
                    .vals
                    .as_deref()
                    .ok_or_else(|| anyhow!("value map without a value buffer"))?;
                map.value_into(vals, &block, node_id, self.max_val_len(), out)
                    .with_context(|| format!("column {} of node {}", column, node_id))
            }
            None => {
                out.clear();
                Ok(())
            }
        }
    }

    /// Number of keys ending at nodes before `node_id`. Nodes are numbered
    /// level by level, so this is not the key's position in sorted order.
    pub fn get_leaf_rank(&self, node_id: u32) -> anyhow::Result<u32> {
        self.rank(Bits::Leaf, node_id, &mut 0)
    }

    /// Key with the given leaf rank, or None if there are not that many
    /// keys.
    pub fn reverse_lookup(&self, rank: u32) -> anyhow::Result<Option<Vec<u8>>> {
        if rank >= self.header.key_count {
            return Ok(None);
        }
        let mut hint = 0;
        let leaf = self.select(Bits::Leaf, rank + 1, &mut hint)?;

        let mut path = vec![leaf];
        let mut node_id = leaf;
        while let Some(parent) = self.parent(node_id, &mut hint)? {
            if path.len() >= self.max_key_len() {
                bail!("parent chain of node {} is deeper than the longest key", leaf);
            }
            path.push(parent);
            node_id = parent;
        }

        let buf = &self.trie[..];
        let (mut tail, mut scratch) = self.tail_bufs();
        let mut nodes = Nodes::new(self);
        let mut key = Vec::new();
        for n in path.into_iter().rev() {
            let (frag, block) = nodes.at(n)?;
            frag.tail_map()
                .node_tail(buf, &block, n, &mut tail, &mut scratch)?;
            key.extend_from_slice(&tail);
        }
        if key.len() > self.max_key_len() {
            bail!("key of rank {} is longer than the longest key", rank);
        }
        Ok(Some(key))
    }

    /// Iterates over all keys and values in ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }
}
