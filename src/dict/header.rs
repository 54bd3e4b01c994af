use anyhow::bail;
use serde::Serialize;

use crate::encoding::{put_u32, read_u32, read_u8, slice};

pub const HEADER_LEN: usize = 72;
pub const MAX_NODES: u32 = (1 << 24) - 1;

/// Fixed header at the start of the primary buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Header {
    pub fragment_count: u8,
    pub node_count: u32,
    pub common_node_count: u32,
    pub key_count: u32,
    pub max_key_len: u32,
    pub max_val_len: u32,
    pub max_tail_len: u32,
    pub cache_count: u32,
    pub sec_cache_count: u32,
    pub cache_loc: u32,
    pub sec_cache_loc: u32,
    pub select_loc: u32,
    pub trie_bv_loc: u32,
    pub leaf_bv_loc: u32,
    pub fragment_table_loc: u32,
    pub aux_column_count: u32,
    pub column_table_loc: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        slice(buf, 0, HEADER_LEN)?;
        let h = Header {
            fragment_count: read_u8(buf, 2)?,
            node_count: read_u32(buf, 4)?,
            common_node_count: read_u32(buf, 12)?,
            key_count: read_u32(buf, 16)?,
            max_key_len: read_u32(buf, 20)?,
            max_val_len: read_u32(buf, 24)?,
            max_tail_len: read_u32(buf, 28)?,
            cache_count: read_u32(buf, 32)?,
            sec_cache_count: read_u32(buf, 36)?,
            cache_loc: read_u32(buf, 40)?,
            sec_cache_loc: read_u32(buf, 44)?,
            select_loc: read_u32(buf, 48)?,
            trie_bv_loc: read_u32(buf, 52)?,
            leaf_bv_loc: read_u32(buf, 56)?,
            fragment_table_loc: read_u32(buf, 60)?,
            aux_column_count: read_u32(buf, 64)?,
            column_table_loc: read_u32(buf, 68)?,
        };
        h.validate()?;
        Ok(h)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.node_count > MAX_NODES {
            bail!("{} nodes exceeds the limit of {}", self.node_count, MAX_NODES);
        }
        if self.cache_count != 0 && !self.cache_count.is_power_of_two() {
            bail!("front cache size {} is not a power of two", self.cache_count);
        }
        if self.node_count > 0 && self.fragment_count == 0 {
            bail!("{} nodes but no fragments", self.node_count);
        }
        if self.key_count > self.node_count {
            bail!("{} keys but only {} nodes", self.key_count, self.node_count);
        }
        Ok(())
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend([0, 0, self.fragment_count, 0]);
        put_u32(out, self.node_count);
        put_u32(out, 0);
        for v in [
            self.common_node_count,
            self.key_count,
            self.max_key_len,
            self.max_val_len,
            self.max_tail_len,
            self.cache_count,
            self.sec_cache_count,
            self.cache_loc,
            self.sec_cache_loc,
            self.select_loc,
            self.trie_bv_loc,
            self.leaf_bv_loc,
            self.fragment_table_loc,
            self.aux_column_count,
            self.column_table_loc,
        ] {
            put_u32(out, v);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        let h = Header {
            fragment_count: 3,
            node_count: 1000,
            key_count: 400,
            max_key_len: 31,
            max_val_len: 9,
            max_tail_len: 12,
            cache_count: 64,
            cache_loc: 72,
            select_loc: 600,
            trie_bv_loc: 700,
            leaf_bv_loc: 800,
            fragment_table_loc: 900,
            aux_column_count: 2,
            column_table_loc: 940,
            ..Default::default()
        };
        let mut buf = Vec::new();
        h.write(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(buf[2], 3);
        assert_eq!(read_u32(&buf, 4).unwrap(), 1000);
        assert_eq!(read_u32(&buf, 60).unwrap(), 900);
        assert_eq!(Header::parse(&buf).unwrap(), h);
        assert!(Header::parse(&buf[..HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn test_header_rejects_bad_counts() {
        let mut buf = Vec::new();
        Header {
            node_count: 10,
            fragment_count: 1,
            cache_count: 3,
            ..Default::default()
        }
        .write(&mut buf);
        assert!(Header::parse(&buf).is_err());

        let mut buf = Vec::new();
        Header {
            node_count: 10,
            ..Default::default()
        }
        .write(&mut buf);
        assert!(Header::parse(&buf).is_err());

        let json = serde_json::to_string(&Header::default()).unwrap();
        assert!(json.contains("\"node_count\":0"));
    }
}
