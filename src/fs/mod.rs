use std::{
    ffi::OsString,
    fs::File,
    io::Read,
    ops::Deref,
    path::{Path, PathBuf},
};

use anyhow::Context;
use memmap2::Mmap;

use crate::config::DictOptions;

/// Read-only bytes backing a dictionary: either a private read-only mapping
/// or the whole file read into memory. Dropping it unmaps or frees exactly
/// once.
#[derive(Debug)]
pub enum Buffer {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Buffer::Mapped(m) => m,
            Buffer::Owned(v) => v,
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(v: Vec<u8>) -> Self {
        Buffer::Owned(v)
    }
}

impl Buffer {
    pub fn open<P>(path: P, opts: &DictOptions) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len() as usize;

        // Zero-length mappings are not portable.
        if !opts.mmap || len == 0 {
            let mut data = Vec::with_capacity(len);
            file.read_to_end(&mut data)
                .with_context(|| format!("reading {}", path.display()))?;
            tracing::debug!(path = %path.display(), len, "read dictionary buffer");
            return Ok(Buffer::Owned(data));
        }

        // SAFETY: the mapping is private and read-only; the format is treated
        // as immutable for the lifetime of the dictionary.
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mapping {}", path.display()))?;
        tracing::debug!(path = %path.display(), len, "mapped dictionary buffer");
        Ok(Buffer::Mapped(map))
    }

    /// Opens a companion buffer that may legitimately be absent.
    pub fn open_optional<P>(path: P, opts: &DictOptions) -> anyhow::Result<Option<Self>>
    where
        P: AsRef<Path>,
    {
        if !path.as_ref().exists() {
            return Ok(None);
        }
        let buf = Self::open(path, opts)?;
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Hints the OS to page in the first `len` bytes. Never affects results.
    pub fn prefetch(&self, len: usize) {
        match self {
            #[cfg(unix)]
            Buffer::Mapped(m) => {
                let len = len.min(m.len());
                if len == 0 {
                    return;
                }
                if let Err(e) = m.advise_range(memmap2::Advice::WillNeed, 0, len) {
                    tracing::warn!(error = %e, "prefetch advice failed");
                }
            }
            _ => {}
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Buffer::Mapped(_))
    }
}

/// Location of the value buffer that accompanies the dictionary at `path`.
pub fn value_path<P>(path: P) -> PathBuf
where
    P: AsRef<Path>,
{
    let mut s: OsString = path.as_ref().as_os_str().to_owned();
    s.push(".val");
    s.into()
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_value_path() {
        assert_eq!(value_path("/tmp/words.sqd"), PathBuf::from("/tmp/words.sqd.val"));
    }

    #[test]
    fn test_open_mapped_and_owned() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("buf");
        File::create(&path)?.write_all(b"hello")?;

        let mapped = Buffer::open(&path, &DictOptions::default())?;
        assert!(mapped.is_mapped());
        assert_eq!(&*mapped, b"hello");
        mapped.prefetch(1 << 20);

        let opts = DictOptions {
            mmap: false,
            ..Default::default()
        };
        let owned = Buffer::open(&path, &opts)?;
        assert!(!owned.is_mapped());
        assert_eq!(&*owned, b"hello");

        assert!(Buffer::open(dir.path().join("missing"), &opts).is_err());
        assert!(Buffer::open_optional(dir.path().join("missing"), &opts)?.is_none());

        let empty = dir.path().join("empty");
        File::create(&empty)?;
        assert!(Buffer::open_optional(&empty, &DictOptions::default())?.is_none());
        Ok(())
    }
}
