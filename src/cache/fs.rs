//! [`FileSystem`] implementations: the real disk and an in-memory fake

use crate::cache::traits::{BoxRead, BoxWrite, EntryKind, FileSystem};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Filesystem backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFs;

impl FileSystem for DiskFs {
    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_new(&self, path: &Path) -> io::Result<BoxWrite> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn open(&self, path: &Path) -> io::Result<BoxRead> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn metadata(&self, path: &Path) -> io::Result<EntryKind> {
        let meta = fs::metadata(path)?;
        Ok(if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        })
    }

    fn current_dir(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }
}

type SharedBytes = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(SharedBytes),
}

/// In-memory filesystem for deterministic tests
///
/// Paths are absolute; relative paths are anchored at `/`. The root directory
/// always exists.
///
/// # Examples
///
/// ```
/// use site_mirror::cache::{FileSystem, MemoryFs};
/// use std::io::Read;
/// use std::path::Path;
///
/// let fs = MemoryFs::with_files([("/cache/a.txt", "hello")]);
/// let mut text = String::new();
/// fs.open(Path::new("/cache/a.txt")).unwrap().read_to_string(&mut text).unwrap();
/// assert_eq!(text, "hello");
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filesystem pre-populated with files (parents are created)
    ///
    /// Panics on conflicting paths; this is test setup.
    pub fn with_files(
        files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>,
    ) -> Self {
        let memory = Self::new();
        for (path, data) in files {
            let path = path.into();
            if let Some(parent) = path.parent() {
                memory
                    .mkdir_all(parent)
                    .unwrap_or_else(|e| panic!("MemoryFs::with_files: {}: {}", path.display(), e));
            }
            let mut writer = memory
                .create_new(&path)
                .unwrap_or_else(|e| panic!("MemoryFs::with_files: {}: {}", path.display(), e));
            writer
                .write_all(&data.into())
                .unwrap_or_else(|e| panic!("MemoryFs::with_files: {}: {}", path.display(), e));
        }
        memory
    }

    /// Returns a copy of a file's content, if the file exists
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        let nodes = self.nodes().ok()?;
        match nodes.get(&anchor(path))? {
            Node::File(data) => data.lock().ok().map(|d| d.clone()),
            Node::Dir => None,
        }
    }

    fn nodes(&self) -> io::Result<MutexGuard<'_, BTreeMap<PathBuf, Node>>> {
        self.nodes
            .lock()
            .map_err(|_| io::Error::other("memory filesystem lock poisoned"))
    }
}

fn anchor(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/").join(path)
    }
}

fn is_root(path: &Path) -> bool {
    path.parent().is_none()
}

fn kind_of(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Option<EntryKind> {
    if is_root(path) {
        return Some(EntryKind::Dir);
    }
    nodes.get(path).map(|node| match node {
        Node::Dir => EntryKind::Dir,
        Node::File(_) => EntryKind::File,
    })
}

fn require_parent_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("/"));
    match kind_of(nodes, parent) {
        Some(EntryKind::Dir) => Ok(()),
        Some(EntryKind::File) => Err(io::Error::other(format!(
            "{} is not a directory",
            parent.display()
        ))),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", parent.display()),
        )),
    }
}

struct MemoryWriter {
    data: SharedBytes,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| io::Error::other("memory file lock poisoned"))?;
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSystem for MemoryFs {
    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        let path = anchor(path);
        let mut nodes = self.nodes()?;

        let mut missing: Vec<&Path> = path.ancestors().filter(|p| !is_root(p)).collect();
        missing.reverse();

        for dir in missing {
            match kind_of(&nodes, dir) {
                Some(EntryKind::Dir) => {}
                Some(EntryKind::File) => {
                    return Err(io::Error::other(format!(
                        "{} is not a directory",
                        dir.display()
                    )));
                }
                None => {
                    nodes.insert(dir.to_path_buf(), Node::Dir);
                }
            }
        }

        Ok(())
    }

    fn create_new(&self, path: &Path) -> io::Result<BoxWrite> {
        let path = anchor(path);
        let mut nodes = self.nodes()?;

        if kind_of(&nodes, &path).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        require_parent_dir(&nodes, &path)?;

        let data = SharedBytes::default();
        nodes.insert(path, Node::File(Arc::clone(&data)));
        Ok(Box::new(MemoryWriter { data }))
    }

    fn open(&self, path: &Path) -> io::Result<BoxRead> {
        let path = anchor(path);
        let nodes = self.nodes()?;

        match nodes.get(&path) {
            Some(Node::File(data)) => {
                let snapshot = data
                    .lock()
                    .map_err(|_| io::Error::other("memory file lock poisoned"))?
                    .clone();
                Ok(Box::new(Cursor::new(snapshot)))
            }
            Some(Node::Dir) => Err(io::Error::other(format!(
                "{} is a directory",
                path.display()
            ))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let (from, to) = (anchor(from), anchor(to));
        let mut nodes = self.nodes()?;

        if kind_of(&nodes, &to) == Some(EntryKind::Dir) {
            return Err(io::Error::other(format!("{} is a directory", to.display())));
        }
        require_parent_dir(&nodes, &to)?;

        match nodes.remove(&from) {
            Some(node @ Node::File(_)) => {
                nodes.insert(to, node);
                Ok(())
            }
            Some(Node::Dir) => {
                nodes.insert(from.clone(), Node::Dir);
                Err(io::Error::other(format!(
                    "{} is a directory",
                    from.display()
                )))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", from.display()),
            )),
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let path = anchor(path);
        let mut nodes = self.nodes()?;
        nodes.retain(|key, _| !key.starts_with(&path));
        Ok(())
    }

    fn metadata(&self, path: &Path) -> io::Result<EntryKind> {
        let path = anchor(path);
        let nodes = self.nodes()?;
        kind_of(&nodes, &path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })
    }

    fn current_dir(&self) -> io::Result<PathBuf> {
        Ok(PathBuf::from("/"))
    }
}
