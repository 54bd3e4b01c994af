// Grouped pointer/value maps.
//
// A map stores each distinct tail string (or value) once, in one of up to 16
// data groups. A node refers to its item through a variable-width code: an
// 8-bit window is looked up in a 256-entry code table that yields the group
// and how many bits the pointer occupies. Pointers of "indexed" groups are
// dense item numbers resolved through a second table; pointers of the other
// groups are byte offsets into the group's data.
//
// Tail maps keep the code (and the low pointer bits) in the node byte itself
// and only spill the remaining high bits into the bitstream. Value maps keep
// code and pointer entirely in the bitstream, one entry per leaf.
//
// Tail groups chain suffixes: an entry may end by borrowing the last `n`
// bytes of the entry stored immediately before it.

use std::mem;

use anyhow::{anyhow, bail, Context};

use crate::{
    buffer::ByteBuf,
    encoding::{read_len, read_u16, read_u24, read_u32, read_u8, read_vint32, slice, BitReader},
    fragment::{Block, Span, NODES_PER_BLOCK},
};

pub const NODES_PER_PTR_BLOCK: u32 = 256;
pub const CODE_TABLE_LEN: usize = 512;
pub const MAP_HEADER_LEN: usize = 29;
pub const MAX_GROUPS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Code {
    pub bit_len: u8,
    pub grp_no: u8,
    pub code_len: u8,
}

impl Code {
    pub fn decode(b0: u8, b1: u8) -> Self {
        Code {
            bit_len: b0,
            grp_no: b1 & 0x0F,
            code_len: b1 >> 5,
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.bit_len, (self.grp_no & 0x0F) | (self.code_len << 5)]
    }
}

/// How values announce their length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEncoding {
    Nibble,
    Varint,
}

impl LenEncoding {
    pub fn from_u8(b: u8) -> anyhow::Result<Self> {
        match b {
            0 => Ok(LenEncoding::Nibble),
            1 => Ok(LenEncoding::Varint),
            _ => bail!("unknown length encoding {}", b),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            LenEncoding::Nibble => 0,
            LenEncoding::Varint => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Tail,
    Value,
}

/// Remembers where the previous tail pointer was read so that a scan over
/// consecutive siblings does not re-derive every bit offset from the block
/// index.
#[derive(Debug, Clone, Copy)]
pub struct PtrCursor {
    map_start: u32,
    node_id: u32,
    bit_pos: usize,
}

/// Scratch space for suffix-chain resolution, sized to the longest tail.
#[derive(Debug, Clone)]
pub struct TailScratch {
    prev: ByteBuf,
    cur: ByteBuf,
}

impl TailScratch {
    pub fn new(max_tail_len: usize) -> Self {
        TailScratch {
            prev: ByteBuf::with_max_len(max_tail_len),
            cur: ByteBuf::with_max_len(max_tail_len),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupMap {
    kind: MapKind,
    span: Span,
    lkup_width: usize,
    lkup_loc: usize,
    ptrs_loc: usize,
    idx2_loc: usize,
    idx2_size: usize,
    grp_idx_limit: usize,
    idx_map: Vec<usize>,
    len_encoding: LenEncoding,
    code_table: [Code; 256],
    groups: Vec<usize>,
}

impl GroupMap {
    /// Parses the map whose header starts at `data_loc` in `buf`.
    pub fn parse(buf: &[u8], data_loc: usize, span: Span, kind: MapKind) -> anyhow::Result<Self> {
        let at = |off: usize| -> anyhow::Result<usize> {
            let rel = read_u32(buf, data_loc + off)? as usize;
            let abs = data_loc + rel;
            if abs > buf.len() {
                bail!("offset {} at header field {} is past the buffer", abs, off);
            }
            Ok(abs)
        };

        let lkup_width = read_u8(buf, data_loc)? as usize;
        if lkup_width != 9 && lkup_width != 10 {
            bail!("unsupported pointer lookup width {}", lkup_width);
        }
        let lkup_loc = at(1)?;
        let grp_dir = at(5)?;
        let packed = read_u32(buf, data_loc + 13)?;
        let ptrs_loc = at(17)?;
        let idx2_loc = at(25)?;

        let idx2_size = if packed & 0x8000_0000 != 0 { 3 } else { 2 };
        let start_bits = (packed >> 20) & 0x0F;
        let grp_idx_limit = ((packed >> 24) & 0x1F) as usize;
        let idx_step_bits = (packed >> 29) & 0x03;

        let last_grp_no = read_u8(buf, grp_dir)? as usize;
        if last_grp_no >= MAX_GROUPS {
            bail!("group count {} exceeds {}", last_grp_no + 1, MAX_GROUPS);
        }
        if grp_idx_limit > last_grp_no + 1 {
            bail!("{} indexed groups but only {} groups", grp_idx_limit, last_grp_no + 1);
        }
        let len_encoding = LenEncoding::from_u8(read_u8(buf, grp_dir + 1)?)?;

        let table = slice(buf, grp_dir + 2, CODE_TABLE_LEN)?;
        let mut code_table = [Code::default(); 256];
        for (i, code) in code_table.iter_mut().enumerate() {
            *code = Code::decode(table[i * 2], table[i * 2 + 1]);
        }

        let mut groups = Vec::with_capacity(last_grp_no + 1);
        for i in 0..=last_grp_no {
            let off = grp_dir + 2 + CODE_TABLE_LEN + i * 4;
            let loc = data_loc + read_u32(buf, off)? as usize;
            if loc > buf.len() {
                bail!("group {} starts past the buffer", i);
            }
            groups.push(loc);
        }

        let mut idx_map = Vec::with_capacity(grp_idx_limit);
        let mut start = 0_usize;
        let mut bits = start_bits;
        for _ in 0..grp_idx_limit {
            idx_map.push(start);
            let entries = 1_usize
                .checked_shl(bits)
                .ok_or_else(|| anyhow!("index group of 2^{} entries", bits))?;
            start = entries
                .checked_mul(idx2_size)
                .and_then(|n| n.checked_add(start))
                .ok_or_else(|| anyhow!("index table overflows"))?;
            bits += idx_step_bits;
        }

        Ok(GroupMap {
            kind,
            span,
            lkup_width,
            lkup_loc,
            ptrs_loc,
            idx2_loc,
            idx2_size,
            grp_idx_limit,
            idx_map,
            len_encoding,
            code_table,
            groups,
        })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn code(&self, window: u8) -> Code {
        self.code_table[window as usize]
    }

    fn group(&self, grp_no: u8) -> anyhow::Result<usize> {
        self.groups
            .get(grp_no as usize)
            .copied()
            .ok_or_else(|| anyhow!("group {} out of range", grp_no))
    }

    fn stream<'a>(&self, buf: &'a [u8]) -> anyhow::Result<BitReader<'a>> {
        let s = buf
            .get(self.ptrs_loc..)
            .ok_or_else(|| anyhow!("pointer stream past the buffer"))?;
        Ok(BitReader::new(s))
    }

    // Bit offset recorded for the 64-node sub-block holding `node_id`.
    fn block_bit_pos(&self, buf: &[u8], node_id: u32) -> anyhow::Result<usize> {
        let node_ct = node_id - self.span.block_start;
        let entry = self.lkup_loc + (node_ct / NODES_PER_PTR_BLOCK) as usize * self.lkup_width;
        let mut pos = if self.lkup_width == 10 {
            read_u32(buf, entry)?
        } else {
            read_u24(buf, entry)?
        } as usize;
        let sub = ((node_ct / NODES_PER_BLOCK) % 4) as usize;
        if sub > 0 {
            pos += read_u16(buf, entry + self.lkup_width - 6 + (sub - 1) * 2)? as usize;
        }
        Ok(pos)
    }

    // First node of `block` whose pointer is counted by this map.
    fn scan_from(&self, block: &Block) -> u32 {
        block.first.max(self.span.start)
    }

    fn check_node(&self, node_id: u32) -> anyhow::Result<()> {
        if node_id < self.span.start || node_id >= self.span.end {
            bail!(
                "node {} is outside fragment range {}..{}",
                node_id,
                self.span.start,
                self.span.end
            );
        }
        Ok(())
    }

    fn tail_bit_pos(
        &self,
        buf: &[u8],
        block: &Block,
        node_id: u32,
        cursor: &mut Option<PtrCursor>,
    ) -> anyhow::Result<usize> {
        let (mut from, mut pos) = match cursor {
            Some(c)
                if c.map_start == self.span.start
                    && c.node_id <= node_id
                    && c.node_id >= self.scan_from(block)
                    && c.node_id / NODES_PER_BLOCK == node_id / NODES_PER_BLOCK =>
            {
                (c.node_id, c.bit_pos)
            }
            _ => (self.scan_from(block), self.block_bit_pos(buf, node_id)?),
        };
        while from < node_id {
            if block.is_ptr(from) {
                pos += self.code(block.byte(from)).bit_len as usize;
            }
            from += 1;
        }
        *cursor = Some(PtrCursor {
            map_start: self.span.start,
            node_id,
            bit_pos: pos,
        });
        Ok(pos)
    }

    fn val_bit_pos(&self, buf: &[u8], block: &Block, node_id: u32) -> anyhow::Result<usize> {
        let stream = self.stream(buf)?;
        let mut pos = self.block_bit_pos(buf, node_id)?;
        for m in self.scan_from(block)..node_id {
            if block.is_leaf(m) {
                pos += self.code(stream.read8(pos)?).bit_len as usize;
            }
        }
        Ok(pos)
    }

    fn resolve(&self, buf: &[u8], grp_no: u8, ptr: u32) -> anyhow::Result<usize> {
        let grp = grp_no as usize;
        if grp >= self.grp_idx_limit {
            return Ok(ptr as usize);
        }
        let loc = self.idx2_loc + self.idx_map[grp] + ptr as usize * self.idx2_size;
        Ok(if self.idx2_size == 3 {
            read_u24(buf, loc)?
        } else {
            read_u16(buf, loc)? as u32
        } as usize)
    }

    /// Locates the tail of a `ptr` node. Returns its group and its offset
    /// within that group's data.
    pub fn tail_ptr(
        &self,
        buf: &[u8],
        block: &Block,
        node_id: u32,
        cursor: &mut Option<PtrCursor>,
    ) -> anyhow::Result<(u8, usize)> {
        self.check_node(node_id)?;
        let node_byte = block.byte(node_id);
        let code = self.code(node_byte);
        if code.code_len > 8 {
            bail!("code length {} for node {}", code.code_len, node_id);
        }
        let node_val_bits = 8 - code.code_len as u32;
        let mut ptr = node_byte as u32 & ((1_u32 << node_val_bits) - 1);
        if code.bit_len > 0 {
            let pos = self.tail_bit_pos(buf, block, node_id, cursor)?;
            let extra = self.stream(buf)?.read(pos, code.bit_len as u32)?;
            ptr |= extra
                .checked_shl(node_val_bits)
                .filter(|_| code.bit_len as u32 + node_val_bits <= 32)
                .ok_or_else(|| anyhow!("tail pointer of node {} is too wide", node_id))?;
        }
        let grp_no = code.grp_no;
        let offset = self.resolve(buf, grp_no, ptr)?;
        Ok((grp_no, offset))
    }

    pub fn first_byte(&self, buf: &[u8], grp_no: u8, offset: usize) -> anyhow::Result<u8> {
        read_u8(buf, self.group(grp_no)? + offset)
    }

    /// Effective first byte of a node: its literal byte, or the first byte of
    /// its tail.
    pub fn node_first_byte(
        &self,
        buf: &[u8],
        block: &Block,
        node_id: u32,
        cursor: &mut Option<PtrCursor>,
    ) -> anyhow::Result<u8> {
        if !block.is_ptr(node_id) {
            return Ok(block.byte(node_id));
        }
        let (grp_no, offset) = self.tail_ptr(buf, block, node_id, cursor)?;
        self.first_byte(buf, grp_no, offset)
    }

    /// Decodes the string stored for a node into `out`. Nodes without the
    /// `ptr` bit contribute just their literal byte.
    pub fn node_tail(
        &self,
        buf: &[u8],
        block: &Block,
        node_id: u32,
        out: &mut ByteBuf,
        scratch: &mut TailScratch,
    ) -> anyhow::Result<()> {
        out.clear();
        if !block.is_ptr(node_id) {
            out.push(block.byte(node_id));
            return Ok(());
        }
        if self.kind != MapKind::Tail {
            bail!("tail of node {} read through a value map", node_id);
        }
        let (grp_no, offset) = self.tail_ptr(buf, block, node_id, &mut None)?;
        self.tail_str(buf, grp_no, offset, out, scratch)
            .with_context(|| format!("tail of node {}", node_id))
    }

    /// Resolves the tail entry at `ptr` in group `grp_no`, following the
    /// suffix chain back to the nearest self-contained entry.
    pub fn tail_str(
        &self,
        buf: &[u8],
        grp_no: u8,
        ptr: usize,
        out: &mut ByteBuf,
        scratch: &mut TailScratch,
    ) -> anyhow::Result<()> {
        let base = self.group(grp_no)?;
        let data = &buf[base..];
        out.clear();

        let mut p = ptr;
        read_literal(data, &mut p, out)?;
        let (sfx_len, _) = read_len(data, p)?;
        if sfx_len == 0 {
            return Ok(());
        }

        let head = data
            .get(..ptr)
            .ok_or_else(|| anyhow!("tail pointer {} past group data", ptr))?;
        let anchor_end = head
            .iter()
            .rposition(|b| *b == 0)
            .ok_or_else(|| anyhow!("tail group {} has no sentinel", grp_no))?;
        if anchor_end == 0 {
            bail!("suffix reference at {} has no preceding entry", ptr);
        }
        let anchor_start = head[..anchor_end]
            .iter()
            .rposition(|b| *b <= 0x1F)
            .map_or(0, |i| i + 1);

        let TailScratch { prev, cur } = scratch;
        prev.clear();
        if anchor_end - anchor_start > prev.max_len() {
            bail!("tail at {} exceeds max tail length", anchor_start);
        }
        prev.extend_from_slice(&head[anchor_start..anchor_end]);

        let mut q = anchor_end + 1;
        while q < ptr {
            cur.clear();
            read_literal(data, &mut q, cur)?;
            let (len, n) = read_len(data, q)?;
            append_suffix(cur, prev, len)?;
            q += n;
            mem::swap(prev, cur);
        }
        if q != ptr {
            bail!("suffix chain misaligned at {} (expected {})", q, ptr);
        }
        append_suffix(out, prev, sfx_len)
    }

    /// Decodes the value of a leaf node into `out`.
    pub fn value_into(
        &self,
        buf: &[u8],
        block: &Block,
        node_id: u32,
        max_len: usize,
        out: &mut Vec<u8>,
    ) -> anyhow::Result<()> {
        if self.kind != MapKind::Value {
            bail!("value of node {} read through a tail map", node_id);
        }
        self.check_node(node_id)?;
        let stream = self.stream(buf)?;
        let mut pos = self.val_bit_pos(buf, block, node_id)?;
        let code = self.code(stream.read8(pos)?);
        if code.code_len > code.bit_len {
            bail!(
                "value code of node {} is longer ({}) than its pointer ({})",
                node_id,
                code.code_len,
                code.bit_len
            );
        }
        pos += code.code_len as usize;
        let ptr = stream.read(pos, (code.bit_len - code.code_len) as u32)?;
        let loc = self.group(code.grp_no)? + self.resolve(buf, code.grp_no, ptr)?;
        let (len, n) = match self.len_encoding {
            LenEncoding::Nibble => read_len(buf, loc)?,
            LenEncoding::Varint => read_vint32(buf, loc)?,
        };
        let len = len as usize;
        if len > max_len {
            bail!("value of node {} is {} bytes, max is {}", node_id, len, max_len);
        }
        out.clear();
        out.extend_from_slice(slice(buf, loc + n, len)?);
        Ok(())
    }
}

// Appends the bytes above 0x1F starting at `*p`, leaving `*p` on the
// terminator.
fn read_literal(data: &[u8], p: &mut usize, out: &mut ByteBuf) -> anyhow::Result<()> {
    loop {
        let b = read_u8(data, *p)?;
        if b <= 0x1F {
            return Ok(());
        }
        if out.is_full() {
            bail!("tail literal at {} exceeds max tail length", *p);
        }
        out.push(b);
        *p += 1;
    }
}

fn append_suffix(out: &mut ByteBuf, from: &[u8], len: u32) -> anyhow::Result<()> {
    let len = len as usize;
    if len > from.len() {
        bail!("suffix of {} bytes borrowed from a {}-byte tail", len, from.len());
    }
    if out.len() + len > out.max_len() {
        bail!("tail exceeds max tail length {}", out.max_len());
    }
    out.extend_from_slice(&from[from.len() - len..]);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoding::write_len;

    fn map_for(groups: Vec<usize>) -> GroupMap {
        GroupMap {
            kind: MapKind::Tail,
            span: Span {
                start: 0,
                block_start: 0,
                end: 1,
            },
            lkup_width: 10,
            lkup_loc: 0,
            ptrs_loc: 0,
            idx2_loc: 0,
            idx2_size: 2,
            grp_idx_limit: 0,
            idx_map: Vec::new(),
            len_encoding: LenEncoding::Nibble,
            code_table: [Code::default(); 256],
            groups,
        }
    }

    // Builds a tail group by hand: each entry is (literal, suffix length).
    fn tail_group(entries: &[(&str, u32)]) -> (Vec<u8>, Vec<usize>) {
        let mut data = vec![0];
        let mut offsets = Vec::new();
        for (lit, sfx) in entries {
            offsets.push(data.len());
            data.extend(lit.as_bytes());
            write_len(&mut data, *sfx);
        }
        (data, offsets)
    }

    fn decode(map: &GroupMap, data: &[u8], offset: usize) -> anyhow::Result<String> {
        let mut out = ByteBuf::with_max_len(64);
        let mut scratch = TailScratch::new(64);
        map.tail_str(data, 0, offset, &mut out, &mut scratch)?;
        Ok(String::from_utf8(out.to_vec())?)
    }

    #[test]
    fn test_suffix_chain() {
        // Full strings: "ending", "reading", "bleeding", "needing", "ring",
        // "string"; the last entry starts a new chain.
        let (data, offsets) = tail_group(&[
            ("ending", 0),
            ("read", 3),
            ("blee", 4),
            ("nee", 4),
            ("r", 3),
            ("string", 0),
        ]);
        let map = map_for(vec![0]);
        let want = ["ending", "reading", "bleeding", "needing", "ring", "string"];
        for (off, w) in offsets.iter().zip(want) {
            assert_eq!(decode(&map, &data, *off).unwrap(), w);
        }
    }

    #[test]
    fn test_long_suffix_lengths() {
        let long = "abcdefghijklmnopqrstuvwxyz0123456789";
        let (data, offsets) = tail_group(&[(long, 0), ("X", 30), ("Y", 31)]);
        let map = map_for(vec![0]);
        assert_eq!(decode(&map, &data, offsets[1]).unwrap(), format!("X{}", &long[6..]));
        // Borrows all 31 bytes of the previous entry, its literal included.
        assert_eq!(decode(&map, &data, offsets[2]).unwrap(), format!("YX{}", &long[6..]));
    }

    #[test]
    fn test_chain_errors() {
        // A suffix reference on the first entry has nothing to borrow from.
        let (data, offsets) = tail_group(&[("abc", 2)]);
        let map = map_for(vec![0]);
        assert!(decode(&map, &data, offsets[0]).is_err());

        // Borrowing more than the previous entry holds.
        let (data, offsets) = tail_group(&[("ab", 0), ("c", 5)]);
        assert!(decode(&map, &data, offsets[1]).is_err());

        // Running off the end of the buffer.
        let map = map_for(vec![0]);
        assert!(decode(&map, b"\0abc", 1).is_err());

        // Unknown group.
        let mut out = ByteBuf::with_max_len(8);
        let mut scratch = TailScratch::new(8);
        assert!(map.tail_str(&data, 3, 1, &mut out, &mut scratch).is_err());
    }

    #[test]
    fn test_tail_capacity_is_enforced() {
        let (data, offsets) = tail_group(&[("abcdefgh", 0), ("xyz", 8)]);
        let map = map_for(vec![0]);
        let mut out = ByteBuf::with_max_len(8);
        let mut scratch = TailScratch::new(8);
        map.tail_str(&data, 0, offsets[0], &mut out, &mut scratch)
            .unwrap();
        assert_eq!(&*out, b"abcdefgh");
        assert!(map
            .tail_str(&data, 0, offsets[1], &mut out, &mut scratch)
            .is_err());
    }

    #[test]
    fn test_code_round_trip() {
        let c = Code {
            bit_len: 17,
            grp_no: 5,
            code_len: 3,
        };
        let [a, b] = c.encode();
        assert_eq!(Code::decode(a, b), c);
    }
}
