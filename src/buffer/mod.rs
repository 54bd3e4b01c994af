use std::ops::Deref;

/// Fixed-capacity, append-only byte accumulator. The backing storage is
/// allocated once; appends past the capacity are dropped.
#[derive(Debug, Clone)]
pub struct ByteBuf {
    buf: Vec<u8>,
    max_len: usize,
}

impl ByteBuf {
    pub fn with_max_len(max_len: usize) -> Self {
        ByteBuf {
            buf: Vec::with_capacity(max_len),
            max_len,
        }
    }

    pub fn push(&mut self, b: u8) {
        if self.buf.len() < self.max_len {
            self.buf.push(b);
        }
    }

    pub fn extend_from_slice(&mut self, b: &[u8]) {
        let room = self.max_len - self.buf.len();
        self.buf.extend_from_slice(&b[..b.len().min(room)]);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Deref for ByteBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

#[test]
fn test_byte_buf_caps_appends() {
    let mut b = ByteBuf::with_max_len(4);
    b.push(b'a');
    b.extend_from_slice(b"bcdef");
    assert_eq!(b.as_slice(), b"abcd");
    assert!(b.is_full());
    b.push(b'x');
    assert_eq!(&*b, b"abcd");
    b.truncate(1);
    b.extend_from_slice(b"zz");
    assert_eq!(&*b, b"azz");
    b.clear();
    assert!(b.is_empty());
    assert_eq!(b.max_len(), 4);
}
