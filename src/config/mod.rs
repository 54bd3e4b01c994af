use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

/// Per-instance settings for loading a dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictOptions {
    /// Map the buffers instead of reading them into memory.
    pub mmap: bool,
    /// Ask the OS to page in the head of the primary buffer at load.
    pub prefetch: bool,
    /// Log a summary of the loaded dictionary at info level.
    pub verbose: bool,
}

impl Default for DictOptions {
    fn default() -> Self {
        DictOptions {
            mmap: true,
            prefetch: true,
            verbose: false,
        }
    }
}

impl DictOptions {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads options from a JSON file. A file that does not exist yields the
    /// defaults.
    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_json(contents.as_str()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::DictOptions;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts = DictOptions::from_json(r#"{"verbose": true}"#).unwrap();
        assert_eq!(
            opts,
            DictOptions {
                mmap: true,
                prefetch: true,
                verbose: true
            }
        );
        assert!(DictOptions::from_json("{\"mmap\": 3}").is_err());
    }

    #[test]
    fn test_load_missing_and_present() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("options.json");
        assert_eq!(DictOptions::load(&path)?, DictOptions::default());

        std::fs::write(&path, r#"{"mmap": false, "prefetch": false}"#)?;
        let opts = DictOptions::load(&path)?;
        assert!(!opts.mmap);
        assert!(!opts.prefetch);
        assert!(!opts.verbose);
        Ok(())
    }
}
