// Fixed-layout readers and writers shared by the dictionary and the writer.
//
// Everything in the on-disk format is little-endian except the pointer
// bitstreams, which are MSB-first, and the variable length prefixes, which
// are big-endian 7-bit chunks.

use anyhow::{anyhow, bail};

const ONES_STEP_4: u64 = 0x1111_1111_1111_1111;
const LSBS_STEP_8: u64 = 0x0101_0101_0101_0101;
const MSBS_STEP_8: u64 = 0x8080_8080_8080_8080;
const INCR_STEP_8: u64 = 0x8040_2010_0804_0201;

pub fn slice(buf: &[u8], pos: usize, len: usize) -> anyhow::Result<&[u8]> {
    pos.checked_add(len)
        .and_then(|end| buf.get(pos..end))
        .ok_or_else(|| anyhow!("read of {} bytes at {} past end of {}", len, pos, buf.len()))
}

pub fn read_u8(buf: &[u8], pos: usize) -> anyhow::Result<u8> {
    buf.get(pos)
        .copied()
        .ok_or_else(|| anyhow!("read at {} past end of {}", pos, buf.len()))
}

pub fn read_u16(buf: &[u8], pos: usize) -> anyhow::Result<u16> {
    Ok(u16::from_le_bytes(slice(buf, pos, 2)?.try_into()?))
}

pub fn read_u24(buf: &[u8], pos: usize) -> anyhow::Result<u32> {
    let b = slice(buf, pos, 3)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

pub fn read_u32(buf: &[u8], pos: usize) -> anyhow::Result<u32> {
    Ok(u32::from_le_bytes(slice(buf, pos, 4)?.try_into()?))
}

pub fn read_u64(buf: &[u8], pos: usize) -> anyhow::Result<u64> {
    Ok(u64::from_le_bytes(slice(buf, pos, 8)?.try_into()?))
}

/// Compares two byte strings. Returns 0 when they are equal, otherwise one
/// more than the index of the first differing position, where running off
/// the end of the shorter string counts as a difference.
pub fn compare(v1: &[u8], v2: &[u8]) -> usize {
    match v1.iter().zip(v2).position(|(a, b)| a != b) {
        Some(k) => k + 1,
        None if v1.len() == v2.len() => 0,
        None => v1.len().min(v2.len()) + 1,
    }
}

/// Reads a big-endian base-128 integer of at most 5 bytes. Returns the value
/// and the number of bytes consumed.
pub fn read_vint32(buf: &[u8], pos: usize) -> anyhow::Result<(u32, usize)> {
    let mut ret: u32 = 0;
    for i in 0..5 {
        let b = read_u8(buf, pos + i)?;
        ret = (ret << 7) | (b & 0x7F) as u32;
        if b & 0x80 == 0 {
            return Ok((ret, i + 1));
        }
    }
    Ok((ret, 5))
}

/// Reads a nibble-form length. A leading byte below 15 is the length itself.
/// Otherwise the leading byte is skipped, 7-bit chunks are taken from the
/// following bytes while their high bit is set, and the low nibble of the
/// next byte finishes the number, which is biased by 15.
pub fn read_len(buf: &[u8], pos: usize) -> anyhow::Result<(u32, usize)> {
    let first = read_u8(buf, pos)?;
    if first < 15 {
        return Ok((first as u32, 1));
    }
    let mut ret: u32 = 0;
    let mut p = pos + 1;
    loop {
        let b = read_u8(buf, p)?;
        if b & 0x80 == 0 {
            ret = (ret << 4) | (b & 0x0F) as u32;
            let len = ret
                .checked_add(15)
                .ok_or_else(|| anyhow!("length at {} overflows", pos))?;
            return Ok((len, p - pos + 1));
        }
        ret = (ret << 7) | (b & 0x7F) as u32;
        p += 1;
        if p - pos > 6 {
            bail!("length at {} does not terminate", pos);
        }
    }
}

/// MSB-first view over a pointer bitstream.
#[derive(Debug, Clone, Copy)]
pub struct BitReader<'a> {
    buf: &'a [u8],
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BitReader { buf }
    }

    // The 8-bit window is speculative: the code inside it may be shorter
    // than 8 bits, so bytes past the end of the stream read as zero.
    pub fn read8(&self, bit_pos: usize) -> anyhow::Result<u8> {
        let idx = bit_pos / 8;
        let filled = bit_pos % 8;
        let hi = read_u8(self.buf, idx)?;
        if filled == 0 {
            return Ok(hi);
        }
        let lo = self.buf.get(idx + 1).copied().unwrap_or(0);
        Ok(((((hi as u16) << 8) | lo as u16) >> (8 - filled)) as u8)
    }

    pub fn read(&self, bit_pos: usize, n: u32) -> anyhow::Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        if n > 32 {
            bail!("pointer of {} bits at bit {}", n, bit_pos);
        }
        let first = bit_pos / 8;
        let last = (bit_pos + n as usize - 1) / 8;
        let mut ret: u64 = 0;
        for b in slice(self.buf, first, last - first + 1)? {
            ret = (ret << 8) | *b as u64;
        }
        let spare = (last - first + 1) * 8 - bit_pos % 8 - n as usize;
        Ok(((ret >> spare) & ((1_u64 << n) - 1)) as u32)
    }
}

/// Number of set bits of `word` strictly below `pos`.
#[inline]
pub fn rank64(word: u64, pos: u32) -> u32 {
    if pos >= 64 {
        word.count_ones()
    } else {
        (word & ((1_u64 << pos) - 1)).count_ones()
    }
}

#[inline]
fn leq_bytes(x: u64, y: u64) -> u64 {
    ((((y | MSBS_STEP_8).wrapping_sub(x & !MSBS_STEP_8)) ^ x ^ y) & MSBS_STEP_8) >> 7
}

#[inline]
fn gt_zero_bytes(x: u64) -> u64 {
    ((x | ((x | MSBS_STEP_8).wrapping_sub(LSBS_STEP_8))) & MSBS_STEP_8) >> 7
}

/// Position of the set bit of `word` with 0-based rank `rank`, computed with
/// Vigna's broadword select (byte-wise prefix sums, then a bit-wise pass over
/// the selected byte). Returns None when `word` has too few set bits.
pub fn select64(word: u64, rank: u32) -> Option<u32> {
    if rank >= word.count_ones() {
        return None;
    }
    let r = rank as u64;
    let mut byte_sums = word - ((word & (0xA * ONES_STEP_4)) >> 1);
    byte_sums = (byte_sums & (3 * ONES_STEP_4)) + ((byte_sums >> 2) & (3 * ONES_STEP_4));
    byte_sums = (byte_sums + (byte_sums >> 4)) & (0xF * LSBS_STEP_8);
    byte_sums = byte_sums.wrapping_mul(LSBS_STEP_8);

    let place = (leq_bytes(byte_sums, r * LSBS_STEP_8).wrapping_mul(LSBS_STEP_8) >> 53) & !0x7;
    let byte_rank = r - (((byte_sums << 8) >> place) & 0xFF);
    let spread_bits = ((word >> place) & 0xFF).wrapping_mul(LSBS_STEP_8) & INCR_STEP_8;
    let bit_sums = gt_zero_bytes(spread_bits).wrapping_mul(LSBS_STEP_8);
    let pos = place + (leq_bytes(bit_sums, byte_rank * LSBS_STEP_8).wrapping_mul(LSBS_STEP_8) >> 56);
    Some(pos as u32)
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend(v.to_le_bytes());
}

pub fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend(&v.to_le_bytes()[..3]);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend(v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend(v.to_le_bytes());
}

pub fn write_vint32(out: &mut Vec<u8>, v: u32) {
    let mut chunks = vec![(v & 0x7F) as u8];
    let mut rest = v >> 7;
    while rest > 0 {
        chunks.push((rest & 0x7F) as u8 | 0x80);
        rest >>= 7;
    }
    out.extend(chunks.iter().rev());
}

// The final byte always carries 0x10 so that an extended length never ends
// in 0x00, which would read as an entry terminator when walking tails
// backwards.
pub fn write_len(out: &mut Vec<u8>, len: u32) {
    if len < 15 {
        out.push(len as u8);
        return;
    }
    let v = len - 15;
    out.push(15);
    let mut chunks = Vec::new();
    let mut hi = v >> 4;
    while hi > 0 {
        chunks.push((hi & 0x7F) as u8 | 0x80);
        hi >>= 7;
    }
    out.extend(chunks.iter().rev());
    out.push(0x10 | (v & 0x0F) as u8);
}

/// MSB-first bitstream accumulator, the counterpart of [BitReader].
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn push(&mut self, value: u64, n: u32) {
        for i in (0..n).rev() {
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;

    fn linear_select(word: u64, rank: u32) -> Option<u32> {
        let mut seen = 0;
        for i in 0..64 {
            if word & (1 << i) != 0 {
                if seen == rank {
                    return Some(i);
                }
                seen += 1;
            }
        }
        None
    }

    #[test]
    fn test_select64_matches_linear_scan() {
        let mut rng = rand::thread_rng();
        let mut words = vec![0, 1, u64::MAX, 1 << 63, 0x8000_0000_0000_0001];
        for _ in 0..2000 {
            let density: u32 = rng.gen_range(0..4);
            let mut w: u64 = rng.gen();
            for _ in 0..density {
                w &= rng.gen::<u64>();
            }
            words.push(w);
        }
        for w in words {
            for r in 0..=64 {
                assert_eq!(select64(w, r), linear_select(w, r), "word {:#x} rank {}", w, r);
            }
        }
    }

    #[test]
    fn test_rank64() {
        assert_eq!(rank64(0b1011, 0), 0);
        assert_eq!(rank64(0b1011, 2), 2);
        assert_eq!(rank64(0b1011, 4), 3);
        assert_eq!(rank64(u64::MAX, 64), 64);
        assert_eq!(rank64(u64::MAX, 63), 63);
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(b"abc", b"abc"), 0);
        assert_eq!(compare(b"abc", b"abd"), 3);
        assert_eq!(compare(b"ab", b"abc"), 3);
        assert_eq!(compare(b"abc", b"ab"), 3);
        assert_eq!(compare(b"", b""), 0);
        assert_eq!(compare(b"x", b""), 1);
    }

    #[test]
    fn test_lengths() {
        for len in [0, 1, 14, 15, 16, 30, 31, 200, 4000, 70_000, 1 << 24] {
            let mut out = vec![0xEE];
            write_len(&mut out, len);
            if len > 0 {
                assert_ne!(*out.last().unwrap(), 0);
            }
            let (v, n) = read_len(&out, 1).unwrap();
            assert_eq!((v, n), (len, out.len() - 1), "len {}", len);

            let mut out = Vec::new();
            write_vint32(&mut out, len);
            assert_eq!(read_vint32(&out, 0).unwrap(), (len, out.len()));
        }
        assert!(read_len(&[15, 0x81], 0).is_err());
    }

    #[test]
    fn test_bits() {
        let mut w = BitWriter::new();
        w.push(0b101, 3);
        w.push(0x3FF, 10);
        w.push(0, 2);
        w.push(0xDEAD_BEEF, 32);
        assert_eq!(w.bit_len(), 47);
        let bytes = w.into_bytes();
        let r = BitReader::new(&bytes);
        assert_eq!(r.read(0, 3).unwrap(), 0b101);
        assert_eq!(r.read(3, 10).unwrap(), 0x3FF);
        assert_eq!(r.read(13, 2).unwrap(), 0);
        assert_eq!(r.read(15, 32).unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read8(0).unwrap(), 0b1011_1111);
        assert_eq!(r.read8(3).unwrap(), 0xFF);
        assert!(r.read(40, 16).is_err());
    }

    #[test]
    fn test_fixed_width() {
        let mut out = Vec::new();
        put_u16(&mut out, 0x0102);
        put_u24(&mut out, 0x030405);
        put_u32(&mut out, 0x06070809);
        put_u64(&mut out, 42);
        assert_eq!(read_u16(&out, 0).unwrap(), 0x0102);
        assert_eq!(read_u24(&out, 2).unwrap(), 0x030405);
        assert_eq!(read_u32(&out, 5).unwrap(), 0x06070809);
        assert_eq!(read_u64(&out, 9).unwrap(), 42);
        assert!(read_u64(&out, 10).is_err());
        assert!(slice(&out, usize::MAX, 2).is_err());
    }
}
