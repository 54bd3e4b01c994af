// A read-only, succinct ordered dictionary.
//
// Keys live in a path-compressed trie stored as four parallel bit-vectors
// (leaf, term, child, ptr) plus one byte per node, navigated with rank and
// select. Multi-byte edges ("tails") and values are deduplicated into grouped
// maps addressed by variable-width codes. Everything is read in place from a
// mapped or owned buffer; nothing is materialized at load time beyond the
// fragment table.

pub mod buffer;
pub mod config;
pub mod dict;
pub mod encoding;
pub mod fragment;
pub mod fs;
pub mod group;
pub mod writer;

pub use config::DictOptions;
pub use dict::{Header, Iter, IterCtx, Lookup, Miss, MissKind, StaticDict};
pub use writer::{DictWriter, Output, WriterOptions};
