//! Content-addressed response cache
//!
//! Every fetched URL maps to one record file (see [`path_for`]). Records use
//! a small line-oriented format (see [`record`]) and are created, replaced and
//! bumped through [`CacheStore`], which works on any [`FileSystem`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use site_mirror::cache::{CacheEntry, CacheStore, MemoryFs};
//! use url::Url;
//!
//! let store = CacheStore::new(Arc::new(MemoryFs::new()), "/cache").unwrap();
//! let url = Url::parse("https://example.com/").unwrap();
//!
//! store.write_placeholder(&url, Duration::from_secs(30)).unwrap();
//! assert!(!store.exists(&url));
//!
//! store
//!     .overwrite(&CacheEntry::new(url.clone(), 200).with_body(None, "hello"))
//!     .unwrap();
//! assert!(store.exists(&url));
//! ```

mod fs;
mod path;
pub mod record;
mod store;
mod traits;

pub use fs::{DiskFs, MemoryFs};
pub use path::{path_for, INDEX_FILE};
pub use record::{CacheEntry, RecordError, RecordHead, RecordReader};
pub use store::{expiry_after, CacheStore};
pub use traits::{BoxRead, BoxWrite, CacheError, CacheResult, EntryKind, FileSystem};
