use std::collections::HashMap;

use anyhow::bail;

use crate::{
    encoding::{put_u16, put_u24, put_u32, write_len, write_vint32, BitWriter},
    fragment::{Span, NODES_PER_BLOCK},
    group::{Code, LenEncoding, MapKind, CODE_TABLE_LEN, MAP_HEADER_LEN, NODES_PER_PTR_BLOCK},
};

// Eight groups keep every unary code within the 3-bit code length.
const MAX_GROUPS: usize = 8;
const LOOKUP_WIDTH: u8 = 10;
const COMPACT_LOOKUP_WIDTH: u8 = 9;
const MIN_SUFFIX: usize = 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MapParams {
    pub start_bits: u32,
    pub step_bits: u32,
    pub len_encoding: LenEncoding,
    /// Store lookup-table bases as u24 instead of u32.
    pub compact_lookup: bool,
}

impl MapParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.start_bits > 15 || self.step_bits > 3 {
            bail!(
                "index group bits out of range (start {}, step {})",
                self.start_bits,
                self.step_bits
            );
        }
        if self.start_bits + (MAX_GROUPS as u32 - 2) * self.step_bits > 24 {
            bail!("index groups would exceed 2^24 entries");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Group<'a> {
    indexed: bool,
    index_bits: u32,
    items: Vec<&'a [u8]>,
    data: Vec<u8>,
    // Offset of each item in `data`, in item order.
    offsets: Vec<usize>,
}

// Unary prefix code of group `grp_no` out of `count`: "1^g 0", except the
// last group which drops the trailing zero.
fn code(grp_no: usize, count: usize) -> (u32, u32) {
    if grp_no + 1 < count {
        (((1 << grp_no) - 1) << 1, grp_no as u32 + 1)
    } else {
        ((1 << grp_no) - 1, grp_no as u32)
    }
}

/// Output of a tail map build: the map bytes and the byte stored in the
/// trie for every pointer node, keyed by node id.
pub(crate) struct TailMap {
    pub bytes: Vec<u8>,
    pub node_bytes: HashMap<u32, u8>,
}

// Distinct items, most referenced first.
fn by_frequency<'a>(refs: &[(u32, &'a [u8])]) -> Vec<&'a [u8]> {
    let mut freq: HashMap<&'a [u8], usize> = HashMap::new();
    for (_, item) in refs {
        *freq.entry(*item).or_default() += 1;
    }
    let mut items: Vec<(&[u8], usize)> = freq.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    items.into_iter().map(|(item, _)| item).collect()
}

fn assign<'a>(items: Vec<&'a [u8]>, params: &MapParams) -> Vec<Group<'a>> {
    let mut groups = Vec::new();
    let mut rest = &items[..];
    let mut bits = params.start_bits;
    while !rest.is_empty() && groups.len() < MAX_GROUPS - 1 {
        let take = rest.len().min(1 << bits);
        groups.push(Group {
            indexed: true,
            index_bits: bits,
            items: rest[..take].to_vec(),
            data: Vec::new(),
            offsets: Vec::new(),
        });
        rest = &rest[take..];
        bits += params.step_bits;
    }
    if !rest.is_empty() || groups.is_empty() {
        groups.push(Group {
            indexed: false,
            index_bits: 0,
            items: rest.to_vec(),
            data: Vec::new(),
            offsets: Vec::new(),
        });
    }
    groups
}

fn common_suffix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

// Lays out a tail group: a sentinel, then entries sorted by their reversed
// bytes so that neighbours share suffixes.
fn layout_tails(g: &mut Group) {
    g.items.sort_by(|a, b| a.iter().rev().cmp(b.iter().rev()));
    g.data.push(0);
    let mut prev: &[u8] = &[];
    for t in &g.items {
        g.offsets.push(g.data.len());
        let c = common_suffix(prev, t);
        if c >= MIN_SUFFIX && c < t.len() {
            g.data.extend_from_slice(&t[..t.len() - c]);
            write_len(&mut g.data, c as u32);
        } else {
            g.data.extend_from_slice(t);
            g.data.push(0);
        }
        prev = *t;
    }
}

fn layout_values(g: &mut Group, enc: LenEncoding) {
    for v in &g.items {
        g.offsets.push(g.data.len());
        match enc {
            LenEncoding::Nibble => write_len(&mut g.data, v.len() as u32),
            LenEncoding::Varint => write_vint32(&mut g.data, v.len() as u32),
        }
        g.data.extend_from_slice(v);
    }
}

fn bits_for(v: usize) -> u32 {
    usize::BITS - v.leading_zeros()
}

struct Layout<'a> {
    groups: Vec<Group<'a>>,
    limit: usize,
    // Group and pointer of every item.
    ptrs: HashMap<&'a [u8], (usize, u32)>,
    table: [Code; 256],
}

fn layout<'a>(refs: &[(u32, &'a [u8])], kind: MapKind, params: &MapParams) -> anyhow::Result<Layout<'a>> {
    let mut groups = assign(by_frequency(refs), params);
    for g in groups.iter_mut() {
        match kind {
            MapKind::Tail => layout_tails(g),
            MapKind::Value => layout_values(g, params.len_encoding),
        }
        if !g.indexed {
            g.index_bits = g.offsets.last().map_or(0, |o| bits_for(*o));
        }
    }
    let limit = groups.iter().filter(|g| g.indexed).count();

    let mut ptrs = HashMap::new();
    for (grp_no, g) in groups.iter().enumerate() {
        for (i, (item, off)) in g.items.iter().zip(&g.offsets).enumerate() {
            let ptr = if g.indexed { i } else { *off };
            ptrs.insert(*item, (grp_no, ptr as u32));
        }
    }

    let count = groups.len();
    let mut table = [Code::default(); 256];
    for (w, entry) in table.iter_mut().enumerate() {
        let ones = (w as u8).leading_ones() as usize;
        let grp_no = ones.min(count - 1);
        let (_, code_len) = code(grp_no, count);
        let index_bits = groups[grp_no].index_bits;
        let bit_len = match kind {
            MapKind::Tail => index_bits.saturating_sub(8 - code_len),
            MapKind::Value => code_len + index_bits,
        };
        let width = match kind {
            MapKind::Tail => bit_len + 8 - code_len,
            MapKind::Value => bit_len,
        };
        if width > 32 {
            bail!("group {} needs {}-bit pointers", grp_no, width);
        }
        *entry = Code {
            bit_len: bit_len as u8,
            grp_no: grp_no as u8,
            code_len: code_len as u8,
        };
    }
    Ok(Layout {
        groups,
        limit,
        ptrs,
        table,
    })
}

// Per-256-node entries of the pointer lookup table, from bit lengths of the
// nodes in `span` (index 0 = span.start).
fn lookup_table(span: Span, bit_lens: &[u32], compact: bool) -> anyhow::Result<Vec<u8>> {
    let max_base = if compact { (1 << 24) - 1 } else { u32::MAX as u64 };
    let mut out = Vec::new();
    let mut pos: u64 = 0;
    let mut node = span.block_start;
    let mut base = 0;
    while node < span.end {
        let rel = node - span.block_start;
        if rel % NODES_PER_PTR_BLOCK == 0 {
            if pos > max_base {
                bail!("pointer stream offset {} does not fit the lookup table", pos);
            }
            base = pos;
            if compact {
                put_u24(&mut out, pos as u32);
            } else {
                put_u32(&mut out, pos as u32);
            }
            out.extend([0; 6]);
        } else if rel % NODES_PER_BLOCK == 0 {
            let sub = ((rel / NODES_PER_BLOCK) % 4) as usize;
            let at = out.len() - 6 + (sub - 1) * 2;
            out[at..at + 2].copy_from_slice(&((pos - base) as u16).to_le_bytes());
        }
        if node >= span.start {
            pos += bit_lens[(node - span.start) as usize] as u64;
        }
        node += 1;
    }
    Ok(out)
}

fn assemble(
    layout: &Layout,
    params: &MapParams,
    lookup: Vec<u8>,
    stream: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    let idx2_size = if layout
        .groups
        .iter()
        .filter(|g| g.indexed)
        .flat_map(|g| g.offsets.iter())
        .any(|o| *o >= 1 << 16)
    {
        3
    } else {
        2
    };

    let mut out = vec![0; MAP_HEADER_LEN];
    let lkup_off = out.len();
    out.extend(lookup);

    let grp_dir = out.len();
    out.push((layout.groups.len() - 1) as u8);
    out.push(params.len_encoding.as_u8());
    for code in &layout.table {
        out.extend(code.encode());
    }
    debug_assert_eq!(out.len(), grp_dir + 2 + CODE_TABLE_LEN);
    let grp_offsets = out.len();
    out.extend(vec![0; layout.groups.len() * 4]);

    let idx2_off = out.len();
    let mut idx_count = 0_usize;
    for g in layout.groups.iter().filter(|g| g.indexed) {
        let entries = 1_usize << g.index_bits;
        for i in 0..entries {
            let off = g.offsets.get(i).copied().unwrap_or(0);
            if off >= 1 << 24 {
                bail!("indexed group holds {} bytes", g.data.len());
            }
            if idx2_size == 3 {
                put_u24(&mut out, off as u32);
            } else {
                put_u16(&mut out, off as u16);
            }
        }
        idx_count += entries;
    }

    let ptrs_off = out.len();
    out.extend(stream);
    out.extend([0; 4]);

    for (i, g) in layout.groups.iter().enumerate() {
        let off = out.len() as u32;
        out[grp_offsets + i * 4..grp_offsets + i * 4 + 4].copy_from_slice(&off.to_le_bytes());
        out.extend_from_slice(&g.data);
    }

    let size_bit: u32 = if idx2_size == 3 { 1 << 31 } else { 0 };
    let packed = size_bit
        | params.step_bits << 29
        | (layout.limit as u32) << 24
        | params.start_bits << 20
        | (idx_count as u32 & 0xF_FFFF);
    out[0] = if params.compact_lookup {
        COMPACT_LOOKUP_WIDTH
    } else {
        LOOKUP_WIDTH
    };
    for (at, v) in [
        (1, lkup_off as u32),
        (5, grp_dir as u32),
        (9, 0),
        (13, packed),
        (17, ptrs_off as u32),
        (21, 0),
        (25, idx2_off as u32),
    ] {
        out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Builds the tail map of one fragment from its pointer nodes, in node
/// order.
pub(crate) fn build_tail_map(span: Span, refs: &[(u32, &[u8])], params: &MapParams) -> anyhow::Result<TailMap> {
    let layout = layout(refs, MapKind::Tail, params)?;
    let count = layout.groups.len();
    let mut stream = BitWriter::new();
    let mut bit_lens = vec![0; (span.end - span.start) as usize];
    let mut node_bytes = HashMap::with_capacity(refs.len());
    for (node_id, tail) in refs {
        let (grp_no, ptr) = layout.ptrs[tail];
        let (code, code_len) = code(grp_no, count);
        let node_val_bits = 8 - code_len;
        let node_byte = ((code << node_val_bits) | (ptr & ((1 << node_val_bits) - 1))) as u8;
        let extra = layout.table[node_byte as usize].bit_len as u32;
        if extra > 0 {
            stream.push((ptr >> node_val_bits) as u64, extra);
        }
        bit_lens[(node_id - span.start) as usize] = extra;
        node_bytes.insert(*node_id, node_byte);
    }
    let lookup = lookup_table(span, &bit_lens, params.compact_lookup)?;
    Ok(TailMap {
        bytes: assemble(&layout, params, lookup, stream.into_bytes())?,
        node_bytes,
    })
}

/// Builds one value map of a fragment from its leaf nodes, in node order.
pub(crate) fn build_value_map(span: Span, refs: &[(u32, &[u8])], params: &MapParams) -> anyhow::Result<Vec<u8>> {
    let layout = layout(refs, MapKind::Value, params)?;
    let count = layout.groups.len();
    let mut stream = BitWriter::new();
    let mut bit_lens = vec![0; (span.end - span.start) as usize];
    for (node_id, val) in refs {
        let (grp_no, ptr) = layout.ptrs[val];
        let g = &layout.groups[grp_no];
        let (code, code_len) = code(grp_no, count);
        stream.push(code as u64, code_len);
        stream.push(ptr as u64, g.index_bits);
        bit_lens[(node_id - span.start) as usize] = code_len + g.index_bits;
    }
    let lookup = lookup_table(span, &bit_lens, params.compact_lookup)?;
    assemble(&layout, params, lookup, stream.into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        buffer::ByteBuf,
        fragment::Block,
        group::{GroupMap, TailScratch},
    };

    fn params() -> MapParams {
        // One item per indexed group, so most items spill into the offset
        // group and need stream bits.
        MapParams {
            start_bits: 0,
            step_bits: 0,
            len_encoding: LenEncoding::Nibble,
            compact_lookup: false,
        }
    }

    // Trie blocks for `n` nodes where every node is a pointer/leaf node.
    fn block_bytes(node_bytes: &HashMap<u32, u8>, n: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        for first in (0..n.max(1)).step_by(64) {
            let left = n - first;
            let all = if left >= 64 { u64::MAX } else { (1 << left) - 1 };
            for w in [all, 0, 0, all] {
                buf.extend(w.to_le_bytes());
            }
            for i in first..first + 64 {
                buf.push(node_bytes.get(&i).copied().unwrap_or(0));
            }
        }
        buf
    }

    fn block_of(trie: &[u8], node_id: u32) -> Block {
        let blk = node_id / NODES_PER_BLOCK;
        Block::parse(trie, blk as usize * 96, blk * NODES_PER_BLOCK).unwrap()
    }

    #[test]
    fn test_tail_map_decodes_every_node() {
        let words = [
            "nothing", "something", "thing", "ring", "string", "bring", "xy", "something", "zz",
            "thing", "other", "another", "mother", "brother", "smother", "thing",
        ];
        let refs: Vec<(u32, &[u8])> = words.iter().enumerate().map(|(i, w)| (i as u32, w.as_bytes())).collect();
        let span = Span {
            start: 0,
            block_start: 0,
            end: refs.len() as u32,
        };
        let map = build_tail_map(span, &refs, &params()).unwrap();
        let trie = block_bytes(&map.node_bytes, refs.len() as u32);
        let block = Block::parse(&trie, 0, 0).unwrap();

        let m = GroupMap::parse(&map.bytes, 0, span, MapKind::Tail).unwrap();
        assert!(m.group_count() > 1);
        let mut out = ByteBuf::with_max_len(16);
        let mut scratch = TailScratch::new(16);
        for (i, w) in words.iter().enumerate() {
            m.node_tail(&map.bytes, &block, i as u32, &mut out, &mut scratch)
                .unwrap();
            assert_eq!(&*out, w.as_bytes(), "node {}", i);
            let mut cursor = None;
            assert_eq!(
                m.node_first_byte(&map.bytes, &block, i as u32, &mut cursor)
                    .unwrap(),
                w.as_bytes()[0]
            );
        }
    }

    #[test]
    fn test_value_map_decodes_every_node() {
        for enc in [LenEncoding::Nibble, LenEncoding::Varint] {
            let long = "v".repeat(300);
            let mut vals: Vec<String> = (0..40).map(|i| format!("value-{}", i % 23)).collect();
            vals.push(long.clone());
            vals.push(String::new());
            let refs: Vec<(u32, &[u8])> = vals.iter().enumerate().map(|(i, v)| (i as u32, v.as_bytes())).collect();
            let span = Span {
                start: 0,
                block_start: 0,
                end: 64,
            };
            let p = MapParams {
                len_encoding: enc,
                ..params()
            };
            let bytes = build_value_map(span, &refs, &p).unwrap();
            let trie = block_bytes(&HashMap::new(), refs.len() as u32);
            let block = Block::parse(&trie, 0, 0).unwrap();
            let m = GroupMap::parse(&bytes, 0, span, MapKind::Value).unwrap();
            let mut out = Vec::new();
            for (i, v) in vals.iter().enumerate() {
                m.value_into(&bytes, &block, i as u32, 300, &mut out).unwrap();
                assert_eq!(out, v.as_bytes(), "node {}", i);
            }
            assert!(m.value_into(&bytes, &block, 40, 299, &mut out).is_err());
        }
    }

    #[test]
    fn test_codes_are_prefix_free() {
        for count in 1..=MAX_GROUPS {
            for g in 0..count {
                let (c, len) = code(g, count);
                assert!(len <= 7);
                let window = (c << (8 - len)) as u8;
                assert_eq!((window.leading_ones() as usize).min(count - 1), g);
            }
        }
    }

    #[test]
    fn test_compact_lookup_table() {
        // Enough nodes for several 64-node sub-blocks and a second 256-node
        // lookup entry, so both the u24 base and the sub-block offsets are
        // read.
        let n = 300_u32;
        let span = Span {
            start: 0,
            block_start: 0,
            end: n,
        };
        let p = MapParams {
            compact_lookup: true,
            ..params()
        };

        let words: Vec<String> = (0..n).map(|i| format!("w{}-{}ending", i % 97, i % 7)).collect();
        let refs: Vec<(u32, &[u8])> = words.iter().enumerate().map(|(i, w)| (i as u32, w.as_bytes())).collect();
        let map = build_tail_map(span, &refs, &p).unwrap();
        assert_eq!(map.bytes[0], COMPACT_LOOKUP_WIDTH);
        let trie = block_bytes(&map.node_bytes, n);
        let m = GroupMap::parse(&map.bytes, 0, span, MapKind::Tail).unwrap();
        let mut out = ByteBuf::with_max_len(32);
        let mut scratch = TailScratch::new(32);
        for (i, w) in words.iter().enumerate() {
            let block = block_of(&trie, i as u32);
            m.node_tail(&map.bytes, &block, i as u32, &mut out, &mut scratch)
                .unwrap();
            assert_eq!(&*out, w.as_bytes(), "node {}", i);
        }

        let vals: Vec<String> = (0..n).map(|i| format!("value-{}", i % 41)).collect();
        let refs: Vec<(u32, &[u8])> = vals.iter().enumerate().map(|(i, v)| (i as u32, v.as_bytes())).collect();
        let bytes = build_value_map(span, &refs, &p).unwrap();
        assert_eq!(bytes[0], COMPACT_LOOKUP_WIDTH);
        let trie = block_bytes(&HashMap::new(), n);
        let m = GroupMap::parse(&bytes, 0, span, MapKind::Value).unwrap();
        let mut out = Vec::new();
        for (i, v) in vals.iter().enumerate() {
            m.value_into(&bytes, &block_of(&trie, i as u32), i as u32, 16, &mut out)
                .unwrap();
            assert_eq!(out, v.as_bytes(), "node {}", i);
        }
    }

    #[test]
    fn test_compact_lookup_limit() {
        let span = Span {
            start: 0,
            block_start: 0,
            end: 257,
        };
        let mut bit_lens = vec![0; 257];
        bit_lens[255] = 1 << 24;
        assert!(lookup_table(span, &bit_lens, true).is_err());
        let wide = lookup_table(span, &bit_lens, false).unwrap();
        assert_eq!(wide.len(), 2 * LOOKUP_WIDTH as usize);
        assert_eq!(&wide[10..14], &(1_u32 << 24).to_le_bytes());
    }

    #[test]
    fn test_map_kind_is_checked() {
        let span = Span {
            start: 0,
            block_start: 0,
            end: 2,
        };
        let refs: Vec<(u32, &[u8])> = vec![(0, b"left"), (1, b"right")];

        let bytes = build_value_map(span, &refs, &params()).unwrap();
        let trie = block_bytes(&HashMap::new(), 2);
        let as_tail = GroupMap::parse(&bytes, 0, span, MapKind::Tail).unwrap();
        let mut out = Vec::new();
        assert!(as_tail
            .value_into(&bytes, &block_of(&trie, 0), 0, 16, &mut out)
            .is_err());

        let map = build_tail_map(span, &refs, &params()).unwrap();
        let trie = block_bytes(&map.node_bytes, 2);
        let as_value = GroupMap::parse(&map.bytes, 0, span, MapKind::Value).unwrap();
        let mut tail = ByteBuf::with_max_len(8);
        let mut scratch = TailScratch::new(8);
        assert!(as_value
            .node_tail(&map.bytes, &block_of(&trie, 1), 1, &mut tail, &mut scratch)
            .is_err());
    }
}
