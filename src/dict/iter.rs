use anyhow::bail;

use super::{rank::Bits, Nodes, StaticDict};
use crate::{buffer::ByteBuf, group::TailScratch};

#[derive(Debug, Clone, Copy)]
struct Frame {
    node_id: u32,
    // Child bits before node_id.
    child_count: u32,
    // Bytes this node contributed to the key.
    tail_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Enter,
    Descend,
    Advance,
}

/// Cursor for an in-order walk over a dictionary. Owned by the caller and
/// never shared between walks.
#[derive(Debug)]
pub struct IterCtx {
    frames: Vec<Frame>,
    key: Vec<u8>,
    val: Vec<u8>,
    step: Step,
    done: bool,
    // Fragment hint carried between calls.
    hint: usize,
    tails: Option<(ByteBuf, TailScratch)>,
}

impl Default for IterCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl IterCtx {
    pub fn new() -> Self {
        IterCtx {
            frames: Vec::new(),
            key: Vec::new(),
            val: Vec::new(),
            step: Step::Enter,
            done: false,
            hint: 0,
            tails: None,
        }
    }

    /// Rewinds to before the first key.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.key.clear();
        self.val.clear();
        self.step = Step::Enter;
        self.done = false;
        self.hint = 0;
        // Sized for the dictionary of the previous walk.
        self.tails = None;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl StaticDict {
    /// Advances `ctx` to the next key in ascending order and returns the key
    /// and its value, or None once every key has been returned.
    pub fn next<'c>(&self, ctx: &'c mut IterCtx) -> anyhow::Result<Option<(&'c [u8], &'c [u8])>> {
        if ctx.done {
            return Ok(None);
        }
        if ctx.frames.is_empty() {
            if self.header.node_count == 0 {
                ctx.done = true;
                return Ok(None);
            }
            ctx.frames.push(Frame {
                node_id: 0,
                child_count: 0,
                tail_len: 0,
            });
            ctx.step = Step::Enter;
        }
        let (tail, scratch) = ctx
            .tails
            .get_or_insert_with(|| (ByteBuf::with_max_len(self.tail_cap), TailScratch::new(self.tail_cap)));

        let buf = &self.trie[..];
        let mut nodes = Nodes::new(self);
        *nodes.hint() = ctx.hint;

        loop {
            let depth = ctx.frames.len();
            let top = match ctx.frames.last_mut() {
                Some(top) => top,
                None => bail!("iteration resumed without a frame"),
            };
            let (frag, block) = nodes.at(top.node_id)?;
            match ctx.step {
                Step::Enter => {
                    frag.tail_map()
                        .node_tail(buf, &block, top.node_id, tail, scratch)?;
                    ctx.key.extend_from_slice(&tail[..]);
                    top.tail_len = tail.len();
                    if ctx.key.len() > self.max_key_len() {
                        bail!("key at node {} is longer than the longest key", top.node_id);
                    }
                    ctx.step = Step::Descend;
                    if block.is_leaf(top.node_id) {
                        let node_id = top.node_id;
                        self.col_val_into(&mut nodes, node_id, 0, &mut ctx.val)?;
                        ctx.hint = *nodes.hint();
                        return Ok(Some((&ctx.key, &ctx.val)));
                    }
                }
                Step::Descend => {
                    if !block.has_child(top.node_id) {
                        ctx.step = Step::Advance;
                        continue;
                    }
                    if depth > self.max_key_len() {
                        bail!("trie below node {} is deeper than the longest key", top.node_id);
                    }
                    let child = self.find_child(top.child_count + 1, nodes.hint())?;
                    let child_count = self.rank(Bits::Child, child, nodes.hint())?;
                    ctx.frames.push(Frame {
                        node_id: child,
                        child_count,
                        tail_len: 0,
                    });
                    ctx.step = Step::Enter;
                }
                Step::Advance => {
                    ctx.key.truncate(ctx.key.len() - top.tail_len);
                    top.tail_len = 0;
                    if block.is_term(top.node_id) {
                        ctx.frames.pop();
                        if ctx.frames.is_empty() {
                            ctx.done = true;
                            return Ok(None);
                        }
                        continue;
                    }
                    if block.has_child(top.node_id) {
                        top.child_count += 1;
                    }
                    top.node_id += 1;
                    if top.node_id >= self.header.node_count {
                        bail!("sibling run runs past the last node");
                    }
                    ctx.step = Step::Enter;
                }
            }
        }
    }
}

/// Iterator over owned key/value pairs. Stops after the first error.
pub struct Iter<'a> {
    dict: &'a StaticDict,
    ctx: IterCtx,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(dict: &'a StaticDict) -> Self {
        Iter {
            dict,
            ctx: IterCtx::new(),
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = anyhow::Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.dict.next(&mut self.ctx) {
            Ok(Some((k, v))) => Some(Ok((k.to_vec(), v.to_vec()))),
            Ok(None) => None,
            Err(e) => {
                self.ctx.done = true;
                Some(Err(e))
            }
        }
    }
}
