use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Input directory {0:?} does not exist or is not a directory")]
    MissingDirectory(PathBuf),
    #[error("Failed to read input metadata for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One candidate execution produced by the fuzzing engine.
///
/// The path is the identity; `modified_millis` (milliseconds since the Unix
/// epoch) is the only available signal for when the engine generated it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputFile {
    pub path: PathBuf,
    pub modified_millis: u64,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, modified_millis: u64) -> Self {
        Self {
            path: path.into(),
            modified_millis,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, InputError> {
        let io_err = |source| InputError::Io {
            path: path.to_path_buf(),
            source,
        };
        let modified = fs::metadata(path).and_then(|m| m.modified()).map_err(io_err)?;
        let modified_millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self::new(path, modified_millis))
    }
}

fn is_engine_bookkeeping(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') || name == "README.txt",
        None => true,
    }
}

/// Regular files directly inside each of `dirs`, oldest first.
///
/// Dotfiles and `README.txt` (engine bookkeeping) are skipped. Ties on
/// modification time are broken by path so the order is deterministic.
pub fn collect_inputs(dirs: &[PathBuf]) -> Result<Vec<InputFile>, InputError> {
    let mut inputs = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            return Err(InputError::MissingDirectory(dir.clone()));
        }
        let entries = fs::read_dir(dir).map_err(|source| InputError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| InputError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && !is_engine_bookkeeping(&path) {
                inputs.push(InputFile::from_path(&path)?);
            }
        }
    }
    inputs.sort_by(|a, b| {
        a.modified_millis
            .cmp(&b.modified_millis)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn write_with_mtime(path: &Path, secs_after_epoch: u64) {
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    #[test]
    fn inputs_are_sorted_by_mtime_across_directories() {
        let corpus = tempdir().unwrap();
        let failures = tempdir().unwrap();
        write_with_mtime(&corpus.path().join("id_2"), 300);
        write_with_mtime(&corpus.path().join("id_1"), 100);
        write_with_mtime(&failures.path().join("crash_1"), 200);
        write_with_mtime(&corpus.path().join(".state"), 50);
        write_with_mtime(&corpus.path().join("README.txt"), 60);
        fs::create_dir(corpus.path().join("nested")).unwrap();

        let inputs =
            collect_inputs(&[corpus.path().to_path_buf(), failures.path().to_path_buf()])
                .unwrap();
        let names: Vec<_> = inputs
            .iter()
            .map(|i| i.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["id_1", "crash_1", "id_2"]);
        assert_eq!(inputs[0].modified_millis, 100_000);
    }

    #[test]
    fn equal_mtimes_fall_back_to_path_order() {
        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("b"), 10);
        write_with_mtime(&dir.path().join("a"), 10);
        let inputs = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        assert!(inputs[0].path.ends_with("a"));
        assert!(inputs[1].path.ends_with("b"));
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        match collect_inputs(&[missing.clone()]) {
            Err(InputError::MissingDirectory(path)) => assert_eq!(path, missing),
            other => panic!("Expected MissingDirectory, got {other:?}"),
        }
    }
}
