//! facesync - local-first face indexing for a remote photo library.
//!
//! facesync keeps a per-file ML record (face detections, crops, alignments,
//! embeddings) in a local [redb](https://github.com/cberner/redb) index,
//! brings out-of-date files up to the current pipeline version in bounded
//! batches, uploads the encrypted results, and periodically clusters every
//! stored face embedding into people.
//!
//! Model inference, cryptography and transport are supplied by the caller
//! through the traits in [`face`], [`reader`], [`remote`], [`people`] and
//! [`context`].
//!
//! # Quick start
//!
//! ```no_run
//! # async fn run(services: facesync::Collaborators) -> facesync::Result<()> {
//! use std::sync::Arc;
//!
//! use facesync::{DataDir, IndexStore, MlSyncService, SyncConfig};
//!
//! let data_dir = DataDir::resolve(None)?;
//! let store = Arc::new(IndexStore::open(&data_dir.index_db())?);
//! let config = SyncConfig::load(&store)?;
//! let service = MlSyncService::new(store, services, config);
//!
//! let result = service.sync("auth-token", 1).await?;
//! println!(
//!     "{} files synced, {} faces, {:?} clusters",
//!     result.files_synced, result.faces_synced, result.cluster_count
//! );
//! # Ok(())
//! # }
//! ```

pub mod clustering;
pub mod config;
pub mod context;
pub mod crop;
pub mod data_dir;
pub mod error;
pub mod executor;
pub mod face;
pub mod index_store;
pub mod people;
pub mod pipeline;
pub mod reader;
pub mod remote;
pub mod service;
pub mod types;

pub use config::SyncConfig;
pub use context::{Collaborators, LocalFileSource, SyncContext};
pub use data_dir::DataDir;
pub use error::{Error, Result, SyncFailure};
pub use index_store::IndexStore;
pub use service::{MlSyncService, SyncResult};
