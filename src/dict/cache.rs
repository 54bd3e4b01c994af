// Front cache: a small hash table of (run start, key byte) → child descents
// for the most travelled literal nodes near the root. Each slot is 8 bytes:
// parent run start u24, node offset within the run u8, child run start u24
// (0 when the node has no children), node byte u8.

use super::StaticDict;
use crate::encoding::{read_u24, read_u8};

pub const CACHE_ENTRY_LEN: usize = 8;
pub const EMPTY_SLOT: u32 = 0x00FF_FFFF;
pub const PROBES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub parent: u32,
    pub offset: u8,
    pub child: u32,
    pub byte: u8,
}

pub fn slot(node_id: u32, byte: u8, mask: u32) -> u32 {
    (node_id ^ (node_id << 5) ^ byte as u32) & mask
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Probe {
    /// No entry; continue from the (possibly advanced) run start.
    Miss,
    Found(u32),
    NotLeaf(u32),
    NoChild(u32),
}

impl StaticDict {
    fn cache_entry(&self, node_id: u32, byte: u8) -> anyhow::Result<Option<CacheEntry>> {
        let mask = self.header.cache_count - 1;
        let buf = &self.trie[..];
        let start = slot(node_id, byte, mask);
        for i in 0..PROBES {
            let loc = self.header.cache_loc as usize
                + ((start + i) & mask) as usize * CACHE_ENTRY_LEN;
            let parent = read_u24(buf, loc)?;
            if parent == EMPTY_SLOT {
                continue;
            }
            if parent == node_id && read_u8(buf, loc + 7)? == byte {
                return Ok(Some(CacheEntry {
                    parent,
                    offset: read_u8(buf, loc + 3)?,
                    child: read_u24(buf, loc + 4)?,
                    byte,
                }));
            }
        }
        Ok(None)
    }

    /// Follows cached descents from the run starting at `*node_id`, advancing
    /// `*key_pos` for every byte consumed.
    pub(crate) fn probe_cache(
        &self,
        key: &[u8],
        key_pos: &mut usize,
        node_id: &mut u32,
        hint: &mut usize,
    ) -> anyhow::Result<Probe> {
        if self.header.cache_count == 0 {
            return Ok(Probe::Miss);
        }
        while let Some(entry) = self.cache_entry(*node_id, key[*key_pos])? {
            *key_pos += 1;
            let node = *node_id + entry.offset as u32;
            if *key_pos == key.len() {
                let frag = self.which_fragment(node, hint)?;
                let block = frag.block(&self.trie, node)?;
                return Ok(if block.is_leaf(node) {
                    Probe::Found(node)
                } else {
                    Probe::NotLeaf(node)
                });
            }
            if entry.child == 0 {
                return Ok(Probe::NoChild(node));
            }
            *node_id = entry.child;
        }
        Ok(Probe::Miss)
    }
}
