// This package writes dictionaries in the layout the reader expects.
//
// Keys arrive in ascending order. They are folded into a trie whose
// single-child chains collapse into multi-byte tails, and the nodes are
// numbered in level order so that sibling runs are contiguous and the
// children of the k-th node with children form the k-th run.
//
// The node range is cut into fragments. Each fragment carries its own tail
// map and one value map per column, so the pointer streams of a fragment only
// ever count that fragment's nodes. Trie blocks that straddle a fragment
// boundary are written into both fragments.
//
// The writer makes no attempt at the compression tuning a production builder
// would do; it exists to produce exact, well-formed layouts.

use std::{fs, path::Path};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    config::DictOptions,
    dict::{
        cache::{slot, CACHE_ENTRY_LEN, EMPTY_SLOT, PROBES},
        rank::{NODES_PER_BV_BLOCK, TERMS_PER_SELECT},
        Header, StaticDict, HEADER_LEN,
    },
    encoding::{put_u24, put_u32, put_u64},
    fragment::{Span, NODES_PER_BLOCK},
    fs::{value_path, Buffer},
    group::LenEncoding,
};

use group::{build_tail_map, build_value_map, MapParams};
use trie::Trie;

mod group;
mod trie;

const MAX_FRAGMENTS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Nodes per fragment. Boundaries need not fall on block boundaries.
    pub nodes_per_fragment: u32,
    /// Front cache slots, 0 or a power of two.
    pub cache_size: u32,
    /// Items in the first indexed group, as a power of two.
    pub idx_start_bits: u32,
    /// Growth of each following indexed group, as a power of two.
    pub idx_step_bits: u32,
    /// Prefix values with varints instead of nibble lengths.
    pub varint_value_lengths: bool,
    /// Write 24-bit pointer lookup bases. Fails if a fragment's pointer
    /// stream outgrows them.
    pub compact_lookup: bool,
    pub aux_columns: usize,
    /// Write the main value column. Without it every value reads as empty.
    pub store_values: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            nodes_per_fragment: 1 << 20,
            cache_size: 256,
            idx_start_bits: 4,
            idx_step_bits: 2,
            varint_value_lengths: false,
            compact_lookup: false,
            aux_columns: 0,
            store_values: true,
        }
    }
}

/// The two buffers of a finished dictionary.
#[derive(Debug)]
pub struct Output {
    pub trie: Vec<u8>,
    pub vals: Vec<u8>,
}

pub struct DictWriter {
    opts: WriterOptions,
    keys: Vec<Vec<u8>>,
    // Main value followed by the auxiliary columns, per key.
    rows: Vec<Vec<Vec<u8>>>,
}

impl DictWriter {
    pub fn new(opts: WriterOptions) -> Self {
        DictWriter {
            opts,
            keys: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Builds a writer from pairs in any order.
    pub fn from_pairs<I>(opts: WriterOptions, pairs: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut w = DictWriter::new(opts);
        for (k, v) in pairs {
            w.add(&k, &v)?;
        }
        Ok(w)
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.add_columns(key, value, &[])
    }

    /// Adds a key with its value and auxiliary column values. Missing
    /// trailing columns are empty.
    pub fn add_columns(&mut self, key: &[u8], value: &[u8], aux: &[&[u8]]) -> anyhow::Result<()> {
        if key.is_empty() {
            bail!("empty key");
        }
        if let Some(last) = self.keys.last() {
            if key <= last.as_slice() {
                bail!("key {:?} is not above the previous key {:?}", key, last);
            }
        }
        if aux.len() > self.opts.aux_columns {
            bail!("{} column values for {} columns", aux.len(), self.opts.aux_columns);
        }
        let mut row = Vec::with_capacity(self.opts.aux_columns + 1);
        row.push(if self.opts.store_values { value.to_vec() } else { Vec::new() });
        for c in 0..self.opts.aux_columns {
            row.push(aux.get(c).map_or_else(Vec::new, |v| v.to_vec()));
        }
        self.keys.push(key.to_vec());
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn map_params(&self) -> anyhow::Result<MapParams> {
        let params = MapParams {
            start_bits: self.opts.idx_start_bits,
            step_bits: self.opts.idx_step_bits,
            len_encoding: if self.opts.varint_value_lengths {
                LenEncoding::Varint
            } else {
                LenEncoding::Nibble
            },
            compact_lookup: self.opts.compact_lookup,
        };
        params.validate()?;
        Ok(params)
    }

    fn spans(&self, node_count: u32) -> anyhow::Result<Vec<Span>> {
        let per = self.opts.nodes_per_fragment.max(1);
        let mut spans = Vec::new();
        let mut start = 0;
        while start < node_count {
            let end = node_count.min(start.saturating_add(per));
            spans.push(Span {
                start,
                block_start: start - start % NODES_PER_BLOCK,
                end,
            });
            start = end;
        }
        if spans.len() > MAX_FRAGMENTS {
            bail!("{} fragments exceeds {}", spans.len(), MAX_FRAGMENTS);
        }
        Ok(spans)
    }

    pub fn finish(self) -> anyhow::Result<Output> {
        let cache_count = self.opts.cache_size;
        if cache_count != 0 && !cache_count.is_power_of_two() {
            bail!("cache size {} is not a power of two", cache_count);
        }
        let params = self.map_params()?;
        let trie = Trie::build(&self.keys)?;
        let n = trie.len();
        let spans = self.spans(n as u32)?;
        let columns = self.opts.aux_columns + 1;

        // Node bytes: literals directly, tails through each fragment's map.
        let mut node_bytes: Vec<u8> = trie.labels.iter().map(|l| l[0]).collect();
        let mut tail_maps = Vec::with_capacity(spans.len());
        for span in &spans {
            let refs: Vec<(u32, &[u8])> = (span.start..span.end)
                .filter(|&i| trie.is_ptr(i as usize))
                .map(|i| (i, trie.labels[i as usize].as_slice()))
                .collect();
            let map = build_tail_map(*span, &refs, &params)?;
            for (&node_id, &b) in &map.node_bytes {
                node_bytes[node_id as usize] = b;
            }
            tail_maps.push(map.bytes);
        }

        // Value maps, column-major. fps[c][f] is the map location + 1.
        let mut vals = Vec::new();
        let mut fps = vec![vec![0_u32; spans.len()]; columns];
        for (c, col_fps) in fps.iter_mut().enumerate() {
            if c == 0 && !self.opts.store_values {
                continue;
            }
            for (f, span) in spans.iter().enumerate() {
                let refs: Vec<(u32, &[u8])> = (span.start..span.end)
                    .filter_map(|i| trie.key[i as usize].map(|k| (i, self.rows[k][c].as_slice())))
                    .collect();
                let bytes = build_value_map(*span, &refs, &params)?;
                col_fps[f] = checked_loc(vals.len() + 1)?;
                vals.extend(bytes);
            }
        }

        let mut out = vec![0; HEADER_LEN];

        let cache_loc = checked_loc(out.len())?;
        out.extend(front_cache(&trie, cache_count));

        // Prefix counts of term, child and leaf bits.
        let prefix = |bits: &[bool]| {
            let mut pre = Vec::with_capacity(bits.len() + 1);
            pre.push(0_u32);
            for (i, b) in bits.iter().enumerate() {
                pre.push(pre[i] + *b as u32);
            }
            pre
        };
        let term_pre = prefix(&trie.term[..]);
        let child_pre = prefix(&trie.child[..]);
        let leaf_pre = prefix(&trie.leaf[..]);
        let blocks = (n + NODES_PER_BV_BLOCK as usize - 1) / NODES_PER_BV_BLOCK as usize;
        let minis = |pre: &[u32], b: usize| -> [u8; 3] {
            let start = b * NODES_PER_BV_BLOCK as usize;
            let mut m = [0; 3];
            for (k, v) in m.iter_mut().enumerate() {
                let end = n.min(start + (k + 1) * NODES_PER_BLOCK as usize);
                *v = (pre[end.max(start).min(n)] - pre[start.min(n)]) as u8;
            }
            m
        };

        let select_loc = checked_loc(out.len())?;
        let terms = term_pre[n];
        let term_nodes: Vec<usize> = (0..n).filter(|&i| trie.term[i]).collect();
        let entries = (terms + TERMS_PER_SELECT - 1) / TERMS_PER_SELECT + 2;
        for j in 0..entries {
            let t = (j * TERMS_PER_SELECT).max(1) as usize;
            let blk = match term_nodes.get(t - 1) {
                Some(node) => node / NODES_PER_BV_BLOCK as usize,
                None => blocks.saturating_sub(1),
            };
            put_u24(&mut out, blk as u32);
        }

        let trie_bv_loc = checked_loc(out.len())?;
        for b in 0..=blocks {
            let start = (b * NODES_PER_BV_BLOCK as usize).min(n);
            put_u24(&mut out, term_pre[start]);
            put_u24(&mut out, child_pre[start]);
            out.extend(minis(&term_pre[..], b));
            out.extend(minis(&child_pre[..], b));
        }

        let leaf_bv_loc = checked_loc(out.len())?;
        for b in 0..=blocks {
            let start = (b * NODES_PER_BV_BLOCK as usize).min(n);
            put_u32(&mut out, leaf_pre[start]);
            out.extend(minis(&leaf_pre[..], b));
            out.push(0);
        }

        let fragment_table_loc = checked_loc(out.len())?;
        out.extend(vec![0; spans.len() * 12]);

        let column_table_loc = checked_loc(out.len())?;
        for col_fps in &fps[1..] {
            for fp in col_fps {
                put_u32(&mut out, *fp);
            }
        }

        for (f, (span, tails)) in spans.iter().zip(&tail_maps).enumerate() {
            let loc = checked_loc(out.len())?;
            let entry = fragment_table_loc as usize + f * 12;
            for (i, v) in [loc, span.block_start, span.end].into_iter().enumerate() {
                out[entry + i * 4..entry + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
            put_u32(&mut out, checked_loc(tails.len())?);
            put_u32(&mut out, fps[0][f]);
            out.extend_from_slice(tails);
            for blk in 0..span.block_count() {
                let first = span.block_start as usize + blk * NODES_PER_BLOCK as usize;
                let word = |bits: &[bool]| {
                    (0..NODES_PER_BLOCK as usize)
                        .filter(|i| first + i < n && bits[first + i])
                        .fold(0_u64, |w, i| w | 1 << i)
                };
                put_u64(&mut out, word(&trie.leaf[..]));
                put_u64(&mut out, word(&trie.term[..]));
                put_u64(&mut out, word(&trie.child[..]));
                let ptrs: Vec<bool> = (0..NODES_PER_BLOCK as usize)
                    .map(|i| first + i < n && trie.is_ptr(first + i))
                    .collect();
                put_u64(&mut out, ptrs.iter().enumerate().fold(0, |w, (i, p)| w | (*p as u64) << i));
                out.extend((0..NODES_PER_BLOCK as usize).map(|i| node_bytes.get(first + i).copied().unwrap_or(0)));
            }
        }
        checked_loc(out.len())?;
        checked_loc(vals.len())?;

        let header = Header {
            fragment_count: spans.len() as u8,
            node_count: n as u32,
            common_node_count: 0,
            key_count: self.keys.len() as u32,
            max_key_len: self.keys.iter().map(|k| k.len()).max().unwrap_or(0) as u32,
            max_val_len: self
                .rows
                .iter()
                .flat_map(|r| r.iter().map(|v| v.len()))
                .max()
                .unwrap_or(0) as u32,
            max_tail_len: trie.labels.iter().map(|l| l.len()).max().unwrap_or(0) as u32,
            cache_count,
            sec_cache_count: 0,
            cache_loc,
            sec_cache_loc: 0,
            select_loc,
            trie_bv_loc,
            leaf_bv_loc,
            fragment_table_loc,
            aux_column_count: self.opts.aux_columns as u32,
            column_table_loc,
        };
        let mut head = Vec::with_capacity(HEADER_LEN);
        header.write(&mut head);
        out[..HEADER_LEN].copy_from_slice(&head);

        tracing::debug!(
            keys = header.key_count,
            nodes = header.node_count,
            fragments = spans.len(),
            trie_bytes = out.len(),
            value_bytes = vals.len(),
            "built dictionary"
        );
        Ok(Output { trie: out, vals })
    }

    /// Builds and loads the dictionary from owned buffers.
    pub fn finish_dict(self) -> anyhow::Result<StaticDict> {
        let Output { trie, vals } = self.finish()?;
        let vals = if vals.is_empty() { None } else { Some(Buffer::from(vals)) };
        StaticDict::from_buffers(Buffer::from(trie), vals, &DictOptions::default())
    }

    /// Writes the dictionary to `path` and its values to `<path>.val`.
    pub fn write<P>(self, path: P) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let Output { trie, vals } = self.finish()?;
        fs::write(path, trie).with_context(|| format!("writing {}", path.display()))?;
        let val_path = value_path(path);
        fs::write(&val_path, vals).with_context(|| format!("writing {}", val_path.display()))?;
        Ok(())
    }
}

fn checked_loc(loc: usize) -> anyhow::Result<u32> {
    u32::try_from(loc).with_context(|| format!("offset {} does not fit in 32 bits", loc))
}

// Caches literal nodes in level order, so the shallowest descents win the
// slots.
fn front_cache(trie: &Trie, cache_count: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(cache_count as usize * CACHE_ENTRY_LEN);
    for _ in 0..cache_count {
        put_u24(&mut out, EMPTY_SLOT);
        out.extend([0; 5]);
    }
    if cache_count == 0 {
        return out;
    }
    let mask = cache_count - 1;
    for node_id in 0..trie.len() {
        let offset = node_id as u32 - trie.run_start[node_id];
        if trie.is_ptr(node_id) || offset > u8::MAX as u32 {
            continue;
        }
        let parent = trie.run_start[node_id];
        let byte = trie.labels[node_id][0];
        let start = slot(parent, byte, mask);
        for i in 0..PROBES {
            let at = ((start + i) & mask) as usize * CACHE_ENTRY_LEN;
            if out[at..at + 3] != [0xFF; 3] {
                continue;
            }
            let mut entry = Vec::with_capacity(CACHE_ENTRY_LEN);
            put_u24(&mut entry, parent);
            entry.push(offset as u8);
            put_u24(&mut entry, trie.first_child[node_id]);
            entry.push(byte);
            out[at..at + CACHE_ENTRY_LEN].copy_from_slice(&entry);
            break;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rejects_unsorted_and_bad_options() {
        let mut w = DictWriter::new(WriterOptions::default());
        w.add(b"b", b"1").unwrap();
        assert!(w.add(b"a", b"2").is_err());
        assert!(w.add(b"b", b"2").is_err());
        assert!(w.add(b"", b"2").is_err());
        assert!(w.add_columns(b"c", b"3", &[b"x"]).is_err());
        assert_eq!(w.len(), 1);

        let w = DictWriter::new(WriterOptions {
            cache_size: 100,
            ..Default::default()
        });
        assert!(w.finish().is_err());

        let w = DictWriter::new(WriterOptions {
            idx_start_bits: 16,
            ..Default::default()
        });
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_fragment_limit() {
        let mut w = DictWriter::new(WriterOptions {
            nodes_per_fragment: 1,
            ..Default::default()
        });
        for i in 0..300 {
            w.add(format!("{:04}", i).as_bytes(), b"").unwrap();
        }
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_options_from_json() {
        let opts: WriterOptions = serde_json::from_str(r#"{"aux_columns": 2}"#).unwrap();
        assert_eq!(opts.aux_columns, 2);
        assert_eq!(opts.cache_size, WriterOptions::default().cache_size);
    }
}
