use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors raised while reading seed inputs from disk.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The seed directory is missing or is not a directory.
    #[error("Seed directory {0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),

    /// Reading the directory or one of its files failed.
    #[error("Failed to read seed path {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Seed inputs loaded from a directory, shared by every worker.
///
/// Workers take cheap snapshots; `reload` swaps in a fresh set so seeds added
/// while fuzzing become visible on the next batch.
#[derive(Debug)]
pub struct SeedCorpus {
    dir: PathBuf,
    extension: Option<String>,
    seeds: RwLock<Arc<Vec<Vec<u8>>>>,
}

impl SeedCorpus {
    /// Loads every regular file directly inside `dir` whose extension matches.
    ///
    /// `extension` of `None` accepts any file. Subdirectories are not traversed.
    pub fn load(dir: impl Into<PathBuf>, extension: Option<&str>) -> Result<Self, CorpusError> {
        let corpus = Self {
            dir: dir.into(),
            extension: extension.map(|ext| ext.trim_start_matches('.').to_string()),
            seeds: RwLock::new(Arc::new(Vec::new())),
        };
        corpus.reload()?;
        Ok(corpus)
    }

    /// Builds a corpus from in-memory seeds with no backing directory scan.
    pub fn from_seeds(seeds: Vec<Vec<u8>>) -> Self {
        Self {
            dir: PathBuf::new(),
            extension: None,
            seeds: RwLock::new(Arc::new(seeds)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-reads the seed directory and returns the number of seeds now loaded.
    ///
    /// A corpus built with [`SeedCorpus::from_seeds`] keeps its seeds.
    pub fn reload(&self) -> Result<usize, CorpusError> {
        if self.dir.as_os_str().is_empty() {
            return Ok(self.len());
        }
        let files = seed_files(&self.dir, self.extension.as_deref())?;
        let mut seeds = Vec::with_capacity(files.len());
        for path in files {
            let data = fs::read(&path).map_err(|source| CorpusError::Io {
                path: path.clone(),
                source,
            })?;
            seeds.push(data);
        }
        let count = seeds.len();
        *self.seeds.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(seeds);
        debug!("Loaded {count} seeds from {:?}", self.dir);
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<Vec<Vec<u8>>> {
        Arc::clone(&self.seeds.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lists seed files in `dir`, sorted by path so loading order is stable.
pub fn seed_files(dir: &Path, extension: Option<&str>) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.is_dir() {
        return Err(CorpusError::NotADirectory(dir.to_path_buf()));
    }
    let io_err = |source| CorpusError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() {
            continue;
        }
        let matches = match extension {
            None => true,
            Some(wanted) => path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted)),
        };
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_reads_matching_files_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), [1u8, 2]).unwrap();
        fs::write(dir.path().join("b.BIN"), [3u8]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(dir.path().join("nested.bin")).unwrap();

        let corpus = SeedCorpus::load(dir.path(), Some("bin")).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(*corpus.snapshot(), vec![vec![1u8, 2], vec![3u8]]);
    }

    #[test]
    fn load_without_extension_accepts_every_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), [1u8]).unwrap();
        fs::write(dir.path().join("seed"), [2u8]).unwrap();

        let corpus = SeedCorpus::load(dir.path(), None).unwrap();
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn load_from_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        match SeedCorpus::load(&missing, Some("bin")) {
            Err(CorpusError::NotADirectory(path)) => assert_eq!(path, missing),
            other => panic!("Expected NotADirectory, got {other:?}"),
        }
    }

    #[test]
    fn reload_picks_up_seeds_added_later() {
        let dir = tempdir().unwrap();
        let corpus = SeedCorpus::load(dir.path(), Some(".bin")).unwrap();
        assert!(corpus.is_empty());

        let before = corpus.snapshot();
        fs::write(dir.path().join("late.bin"), b"LATE").unwrap();
        assert_eq!(corpus.reload().unwrap(), 1);

        assert!(before.is_empty(), "existing snapshots are not mutated");
        assert_eq!(corpus.snapshot()[0], b"LATE".to_vec());
    }

    #[test]
    fn in_memory_corpus_survives_reload() {
        let corpus = SeedCorpus::from_seeds(vec![vec![0u8; 4]]);
        assert_eq!(corpus.reload().unwrap(), 1);
        assert_eq!(corpus.len(), 1);
    }
}
