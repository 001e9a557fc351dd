//! Persistence of the corpus, crashing inputs and timed-out payloads.

use crate::corpus::Corpus;
use crate::input::Input;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// A file or directory under the output root could not be read or written.
    #[error("storage I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entries are named by their hex md5; anything else never reaches the disk.
    #[error("refusing to store an entry named {0:?}")]
    InvalidName(String),

    #[error("failed to serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_md5_hex(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Where the orchestrator loads its corpus from and writes its findings to.
///
/// Every failure is reported to the caller, which logs it and keeps fuzzing.
pub trait Storage: Send + Sync {
    fn load_corpus(&self) -> Result<Corpus, StorageError>;

    fn store_corpus(&self, corpus: &Corpus) -> Result<(), StorageError>;

    /// Persists an input whose execution reported an error.
    fn store_crasher(&self, input: &Input) -> Result<(), StorageError>;

    /// Persists a payload the worker never answered.
    fn store_timeout(&self, payload: &[u8]) -> Result<(), StorageError>;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn load_corpus(&self) -> Result<Corpus, StorageError> {
        (**self).load_corpus()
    }

    fn store_corpus(&self, corpus: &Corpus) -> Result<(), StorageError> {
        (**self).store_corpus(corpus)
    }

    fn store_crasher(&self, input: &Input) -> Result<(), StorageError> {
        (**self).store_crasher(input)
    }

    fn store_timeout(&self, payload: &[u8]) -> Result<(), StorageError> {
        (**self).store_timeout(payload)
    }
}

/// A payload rendered in forms a human can paste into a reproducer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PayloadForms {
    pub utf8: String,
    pub hex: String,
}

impl PayloadForms {
    pub fn new(payload: &[u8]) -> Self {
        Self {
            utf8: String::from_utf8_lossy(payload).into_owned(),
            hex: hex::encode(payload),
        }
    }
}

/// What gets written for every crasher or timeout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindingRecord {
    pub error: String,
    pub input: PayloadForms,
}

/// Directory-backed storage.
///
/// ```text
/// <root>/corpus/<coverage hash>.json    serialized Input
/// <root>/crashers/<coverage hash>.json  FindingRecord
/// <root>/timeouts/<payload md5>.json    FindingRecord
/// ```
///
/// Files in `corpus/` that are not serialized inputs are loaded as raw seeds.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    const CORPUS_DIR: &'static str = "corpus";
    const CRASHERS_DIR: &'static str = "crashers";
    const TIMEOUTS_DIR: &'static str = "timeouts";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join(Self::CORPUS_DIR)
    }

    pub fn crashers_dir(&self) -> PathBuf {
        self.root.join(Self::CRASHERS_DIR)
    }

    pub fn timeouts_dir(&self) -> PathBuf {
        self.root.join(Self::TIMEOUTS_DIR)
    }

    fn write_json<T: Serialize>(&self, dir: &Path, name: &str, value: &T) -> Result<(), StorageError> {
        if !is_md5_hex(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let path = dir.join(format!("{name}.json"));
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| {
            StorageError::Serialization {
                what: path.display().to_string(),
                source,
            }
        })?;
        fs::write(&path, bytes).map_err(io_error(&path))
    }

    fn load_entry(path: &Path) -> Result<Input, StorageError> {
        let bytes = fs::read(path).map_err(io_error(path))?;
        match serde_json::from_slice::<Input>(&bytes) {
            Ok(input) if !input.hash().is_empty() => Ok(input),
            _ => Ok(Input::seed(bytes)),
        }
    }
}

impl Storage for FileStorage {
    fn load_corpus(&self) -> Result<Corpus, StorageError> {
        let dir = self.corpus_dir();
        let mut corpus = Corpus::new();
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(corpus),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut paths = Vec::new();
        for entry in listing {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            corpus.put(Self::load_entry(&path)?);
        }
        log::debug!("loaded {} corpus entries from {:?}", corpus.len(), dir);
        Ok(corpus)
    }

    fn store_corpus(&self, corpus: &Corpus) -> Result<(), StorageError> {
        let dir = self.corpus_dir();
        for input in corpus.inputs() {
            match self.write_json(&dir, input.hash(), input) {
                Err(StorageError::InvalidName(name)) => {
                    log::warn!("skipping corpus entry with invalid hash {name:?}");
                }
                result => result?,
            }
        }
        Ok(())
    }

    fn store_crasher(&self, input: &Input) -> Result<(), StorageError> {
        let record = FindingRecord {
            error: input
                .summary
                .error
                .clone()
                .unwrap_or_else(|| "target reported an error".to_string()),
            input: PayloadForms::new(&input.payload),
        };
        self.write_json(&self.crashers_dir(), input.hash(), &record)
    }

    fn store_timeout(&self, payload: &[u8]) -> Result<(), StorageError> {
        let record = FindingRecord {
            error: "timeout".to_string(),
            input: PayloadForms::new(payload),
        };
        let name = format!("{:x}", md5::compute(payload));
        self.write_json(&self.timeouts_dir(), &name, &record)
    }
}

/// Keeps everything in memory. Useful for dry runs and for inspecting what
/// the orchestrator persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    seeds: Vec<Input>,
    corpus: Mutex<Option<Vec<Input>>>,
    crashers: Mutex<Vec<Input>>,
    timeouts: Mutex<Vec<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose `load_corpus` returns these inputs.
    pub fn with_seeds(seeds: Vec<Input>) -> Self {
        Self {
            seeds,
            ..Self::default()
        }
    }

    /// Inputs from the last `store_corpus`, if any.
    pub fn stored_corpus(&self) -> Option<Vec<Input>> {
        self.corpus.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn crashers(&self) -> Vec<Input> {
        self.crashers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn timeouts(&self) -> Vec<Vec<u8>> {
        self.timeouts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Storage for MemoryStorage {
    fn load_corpus(&self) -> Result<Corpus, StorageError> {
        let mut corpus = Corpus::new();
        for seed in &self.seeds {
            corpus.put(seed.clone());
        }
        Ok(corpus)
    }

    fn store_corpus(&self, corpus: &Corpus) -> Result<(), StorageError> {
        *self.corpus.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(corpus.inputs().cloned().collect());
        Ok(())
    }

    fn store_crasher(&self, input: &Input) -> Result<(), StorageError> {
        self.crashers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input.clone());
        Ok(())
    }

    fn store_timeout(&self, payload: &[u8]) -> Result<(), StorageError> {
        self.timeouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::test_utils::executed;
    use tempfile::tempdir;

    fn hash_of(c: char) -> String {
        c.to_string().repeat(32)
    }

    #[test]
    fn missing_output_directory_loads_an_empty_corpus() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nothing-here"));
        assert!(storage.load_corpus().unwrap().is_empty());
    }

    #[test]
    fn stored_corpus_loads_back_with_the_same_entries() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let mut corpus = Corpus::new();
        corpus.put(executed(&hash_of('a'), 3, 10.0));
        let mut deep = executed(&hash_of('b'), 7, 20.0);
        deep.depth = 12;
        corpus.put(deep.clone());
        storage.store_corpus(&corpus).unwrap();

        assert!(storage.corpus_dir().join(format!("{}.json", hash_of('a'))).is_file());
        let loaded = storage.load_corpus().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&hash_of('b')), Some(&deep));
    }

    #[test]
    fn raw_files_are_loaded_as_seeds() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        fs::create_dir_all(storage.corpus_dir()).unwrap();
        fs::write(storage.corpus_dir().join("seed.txt"), b"{\"k\": [1, 2]}").unwrap();
        fs::write(storage.corpus_dir().join("empty"), b"").unwrap();

        let loaded = storage.load_corpus().unwrap();
        assert_eq!(loaded.len(), 2);
        let seed = loaded
            .inputs()
            .find(|input| input.payload == b"{\"k\": [1, 2]}")
            .expect("raw seed should be loaded verbatim");
        assert_eq!(seed.depth, 0);
        assert_eq!(seed.hash().len(), 32);
    }

    #[test]
    fn crashers_and_timeouts_are_written_as_findings() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let mut crasher = executed(&hash_of('c'), 1, 1.0);
        crasher.payload = b"BAD\xff".to_vec();
        crasher.summary.error = Some("explicit panic".to_string());
        storage.store_crasher(&crasher).unwrap();
        storage.store_timeout(b"slow").unwrap();

        let record: FindingRecord = serde_json::from_slice(
            &fs::read(storage.crashers_dir().join(format!("{}.json", hash_of('c')))).unwrap(),
        )
        .unwrap();
        assert_eq!(record.error, "explicit panic");
        assert_eq!(record.input.hex, "424144ff");

        let name = format!("{:x}.json", md5::compute(b"slow"));
        let record: FindingRecord =
            serde_json::from_slice(&fs::read(storage.timeouts_dir().join(name)).unwrap()).unwrap();
        assert_eq!(record.error, "timeout");
        assert_eq!(record.input.utf8, "slow");
    }

    #[test]
    fn names_that_are_not_hashes_are_refused() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("out"));

        let escaping = executed("../../escaped", 1, 1.0);
        assert!(matches!(
            storage.store_crasher(&escaping),
            Err(StorageError::InvalidName(_))
        ));
        assert!(!dir.path().join("escaped.json").exists());

        let mut corpus = Corpus::new();
        corpus.put(executed("", 1, 1.0));
        corpus.put(executed(&hash_of('d'), 1, 1.0));
        storage.store_corpus(&corpus).unwrap();
        let loaded = storage.load_corpus().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get(&hash_of('d')).is_some());

        let upper = executed(&"A".repeat(32), 1, 1.0);
        assert!(storage.store_crasher(&upper).is_err());
    }

    #[test]
    fn unwritable_root_is_reported_not_panicked() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let storage = FileStorage::new(&blocker);
        assert!(matches!(
            storage.store_timeout(b"p"),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn memory_storage_records_everything() {
        let storage = MemoryStorage::with_seeds(vec![executed("s", 1, 1.0)]);
        let corpus = storage.load_corpus().unwrap();
        assert_eq!(corpus.len(), 1);
        storage.store_timeout(b"t").unwrap();
        storage.store_crasher(&executed("c", 1, 1.0)).unwrap();
        storage.store_corpus(&corpus).unwrap();
        assert_eq!(storage.timeouts(), vec![b"t".to_vec()]);
        assert_eq!(storage.crashers().len(), 1);
        assert_eq!(storage.stored_corpus().map(|c| c.len()), Some(1));
    }
}
