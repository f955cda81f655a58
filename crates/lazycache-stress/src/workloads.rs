use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use lazycache::{BoxError, Cache, Cacheable, CacheEntry, Freshness};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The files requested by this workload, in round-robin order.
    pub keys: Vec<PathBuf>,
    /// The timeout of every single load.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

/// The contents of a file, held in memory until the file changes on disk.
#[derive(Debug)]
pub struct FileObject {
    path: String,
    contents: Vec<u8>,
    modified: SystemTime,
}

impl FileObject {
    /// Reads the file at `path` into memory.
    pub async fn open(path: String) -> Result<Self, BoxError> {
        let metadata = tokio::fs::metadata(&path).await?;
        let contents = tokio::fs::read(&path).await?;
        Ok(Self {
            path,
            contents,
            modified: metadata.modified()?,
        })
    }

    /// The number of bytes held in memory.
    pub fn size(&self) -> usize {
        self.contents.len()
    }
}

impl Cacheable for FileObject {
    fn id(&self) -> &str {
        &self.path
    }

    fn check_freshness(&self) -> Result<Freshness, BoxError> {
        let modified = fs::metadata(&self.path)?.modified()?;
        Ok(if modified == self.modified {
            Freshness::Fresh
        } else {
            Freshness::Outdated
        })
    }

    fn release(&self) -> Result<(), BoxError> {
        tracing::trace!(path = %self.path, bytes = self.size(), "Releasing file");
        Ok(())
    }
}

/// A workload ready to run against the cache.
pub struct ParsedWorkload {
    keys: Vec<String>,
    timeout: Duration,
    next: AtomicUsize,
}

impl ParsedWorkload {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Validates the keys of the workload, so that missing files are reported before the test starts.
pub fn prepare_workload(workload: &Workload) -> io::Result<ParsedWorkload> {
    let keys = workload
        .keys
        .iter()
        .map(PathBuf::as_path)
        .map(to_key)
        .collect::<io::Result<Vec<_>>>()?;

    if keys.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "workload has no keys",
        ));
    }

    Ok(ParsedWorkload {
        keys,
        timeout: workload.timeout,
        next: AtomicUsize::new(0),
    })
}

fn to_key(path: &Path) -> io::Result<String> {
    let path = fs::canonicalize(path)?;
    path.into_os_string().into_string().map_err(|path| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("path is not valid UTF-8: {path:?}"),
        )
    })
}

/// Loads the next key of the workload.
pub async fn process_workload(
    cache: &Cache<FileObject>,
    workload: &ParsedWorkload,
) -> CacheEntry<usize> {
    let index = workload.next.fetch_add(1, Ordering::Relaxed) % workload.keys.len();
    let object = cache.load(&workload.keys[index], workload.timeout).await?;
    Ok(object.size())
}
