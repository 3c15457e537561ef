use crate::cache::path::path_for;
use crate::cache::record::{
    encode_expiry, write_record, CacheEntry, RecordHead, RecordReader, EXPIRES,
};
use crate::cache::traits::{BoxRead, BoxWrite, CacheError, CacheResult, EntryKind, FileSystem};
use chrono::{DateTime, TimeDelta, Utc};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Returns `now + ttl`, saturating at the largest representable time
pub fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// File-backed cache of HTTP responses keyed by URL
///
/// New records are created exclusively, so the first writer wins. Replacing a
/// record (`overwrite`, `write_placeholder`, `bump`) goes through a temporary
/// sibling and a rename, so readers never observe a half-written file.
pub struct CacheStore {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    temp_counter: AtomicU64,
}

impl CacheStore {
    /// Creates a store rooted at `root`
    ///
    /// A relative root is anchored at the filesystem's working directory.
    pub fn new(fs: Arc<dyn FileSystem>, root: impl AsRef<Path>) -> CacheResult<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            fs.current_dir()?.join(root)
        };

        tracing::debug!("Cache root: {}", root.display());

        Ok(Self {
            root,
            fs,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, url: &Url) -> PathBuf {
        path_for(&self.root, url)
    }

    /// Returns true if a usable record exists for `url`
    ///
    /// Placeholders do not count. Unreadable records are logged and reported
    /// as missing so they get fetched again.
    pub fn exists(&self, url: &Url) -> bool {
        match self.head(url) {
            Ok(head) => !head.is_placeholder(),
            Err(CacheError::NotFound(_)) => false,
            Err(e) => {
                tracing::warn!("Treating unreadable cache record for {} as missing: {}", url, e);
                false
            }
        }
    }

    /// Opens and decodes the head of the record for `url`
    pub fn head(&self, url: &Url) -> CacheResult<RecordHead> {
        let reader = RecordReader::open(self.open(url)?)?;
        Ok(reader.head().clone())
    }

    /// Opens the raw record for streaming
    pub fn open(&self, url: &Url) -> CacheResult<BoxRead> {
        match self.fs.open(&self.path_for(url)) {
            Ok(reader) => Ok(reader),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(url.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a new record; never replaces an existing one
    ///
    /// # Errors
    ///
    /// * [`CacheError::PathConflict`] if an ancestor of the record path is a
    ///   file, or the record path is a directory
    /// * [`CacheError::AlreadyExists`] if the record file exists
    pub fn write(&self, entry: &CacheEntry) -> CacheResult<()> {
        let path = self.path_for(&entry.url);
        self.check_ancestors(&path)?;
        match self.kind_at(&path)? {
            Some(EntryKind::Dir) => return Err(CacheError::PathConflict(path)),
            Some(EntryKind::File) => return Err(CacheError::AlreadyExists(path)),
            None => {}
        }

        if let Some(parent) = path.parent() {
            self.fs.mkdir_all(parent)?;
        }

        let mut writer = match self.fs.create_new(&path) {
            Ok(writer) => writer,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CacheError::AlreadyExists(path));
            }
            Err(e) => return Err(e.into()),
        };

        let result = write_record(&mut writer, entry);
        drop(writer);
        if let Err(e) = result {
            if let Err(cleanup) = self.fs.remove_all(&path) {
                tracing::warn!("Failed to remove partial record {}: {}", path.display(), cleanup);
            }
            return Err(e.into());
        }

        tracing::debug!("Cached {} ({}) at {}", entry.url, entry.status, path.display());
        Ok(())
    }

    /// Replaces whatever record exists for the entry's URL
    pub fn overwrite(&self, entry: &CacheEntry) -> CacheResult<()> {
        let path = self.path_for(&entry.url);
        self.check_ancestors(&path)?;
        if self.kind_at(&path)? == Some(EntryKind::Dir) {
            return Err(CacheError::PathConflict(path));
        }

        if let Some(parent) = path.parent() {
            self.fs.mkdir_all(parent)?;
        }

        self.replace_with(&path, |writer| write_record(writer, entry))?;
        tracing::debug!("Replaced {} ({}) at {}", entry.url, entry.status, path.display());
        Ok(())
    }

    /// Marks `url` as being downloaded until `now + ttl`
    pub fn write_placeholder(&self, url: &Url, ttl: Duration) -> CacheResult<()> {
        self.overwrite(&CacheEntry::placeholder(url.clone(), expiry_after(ttl)))
    }

    /// Extends the expiry of the record for `url` to at least `now + ttl`
    ///
    /// Every other header line and the body are kept byte-for-byte. A missing
    /// record, or one without a readable expiry, is replaced by a placeholder.
    pub fn bump(&self, url: &Url, ttl: Duration) -> CacheResult<()> {
        let path = self.path_for(url);
        let expiry = expiry_after(ttl);

        let reader = match self.fs.open(&path) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::debug!("Nothing to bump for {} ({}), writing placeholder", url, e);
                return self.write_placeholder(url, ttl);
            }
        };

        let record = match RecordReader::open(reader) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Discarding unreadable record for {}: {}", url, e);
                return self.write_placeholder(url, ttl);
            }
        };

        let previous = match record.head().expires() {
            Ok(Some(previous)) => previous,
            Ok(None) | Err(_) => {
                tracing::warn!("Discarding record without valid expiry for {}", url);
                return self.write_placeholder(url, ttl);
            }
        };

        let value = encode_expiry(previous.max(expiry));
        let (head, mut rest) = record.into_patched_head(EXPIRES, &value);

        self.replace_with(&path, |writer| {
            writer.write_all(&head)?;
            io::copy(&mut rest, writer)?;
            Ok(())
        })
    }

    /// Deletes the record for `url` (and anything below its path)
    pub fn remove(&self, url: &Url) -> CacheResult<()> {
        self.fs.remove_all(&self.path_for(url))?;
        Ok(())
    }

    fn kind_at(&self, path: &Path) -> CacheResult<Option<EntryKind>> {
        match self.fs.metadata(path) {
            Ok(kind) => Ok(Some(kind)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fails if any ancestor of `path` is a plain file
    fn check_ancestors(&self, path: &Path) -> CacheResult<()> {
        for ancestor in path.ancestors().skip(1) {
            // Below a file, lookups fail with "not a directory"; keep climbing
            match self.fs.metadata(ancestor).ok() {
                Some(EntryKind::File) => {
                    return Err(CacheError::PathConflict(ancestor.to_path_buf()));
                }
                // Everything above an existing directory is a directory too
                Some(EntryKind::Dir) => return Ok(()),
                None => {}
            }
        }
        Ok(())
    }

    fn replace_with<F>(&self, path: &Path, fill: F) -> CacheResult<()>
    where
        F: FnOnce(&mut BoxWrite) -> io::Result<()>,
    {
        let temp = self.temp_sibling(path);
        let mut writer = self.fs.create_new(&temp)?;

        let result = fill(&mut writer).and_then(|_| writer.flush());
        drop(writer);
        let result = result.and_then(|_| self.fs.rename(&temp, path));

        if let Err(e) = result {
            if let Err(cleanup) = self.fs.remove_all(&temp) {
                tracing::warn!("Failed to remove temp file {}: {}", temp.display(), cleanup);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn temp_sibling(&self, path: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        // `#` never appears in a cache path segment
        path.with_file_name(format!("{}#tmp{}-{}", name, std::process::id(), n))
    }
}
