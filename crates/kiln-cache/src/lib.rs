//! Cache and workspace stores for Kiln.
//!
//! Cache entries are append-only and looked up by exact key or longest
//! prefix; workspace snapshots are scoped to the run that produced them.

pub mod archiver;
pub mod index;
pub mod keys;
pub mod resolver;
pub mod retention;
pub mod store;
pub mod workspace;

pub use archiver::{Compression, create_archive, extract_archive};
pub use index::CacheIndex;
pub use keys::{KeyContext, KeyExpr, KeyTemplate, RenderedKey, sanitize_key};
pub use resolver::CacheKeyResolver;
pub use retention::RetentionPolicy;
pub use store::{FilesystemCacheStore, MemoryCacheStore};
pub use workspace::FilesystemWorkspaceStore;
