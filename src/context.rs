use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    error::{Error, Result, SyncFailure},
    executor::WorkerPool,
    face::{FaceAligner, FaceCropper, FaceDetector, FaceEmbedder},
    index_store::IndexStore,
    people::FaceClusterer,
    reader::ReaderService,
    remote::{EmbeddingUploader, MetadataEncryptor},
    types::{FileId, FileMeta, LibraryMlData, OwnerId},
};

/// Lists the files of the local library.
///
/// Implementations may return files of other owners; the context keeps
/// only those belonging to the user being synced.
#[async_trait]
pub trait LocalFileSource: Send + Sync {
    async fn list_local_files(
        &self,
        owner_id: OwnerId,
    ) -> Result<Vec<FileMeta>>;
}

/// External services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub files: Arc<dyn LocalFileSource>,
    pub reader: ReaderService,
    pub detector: Arc<dyn FaceDetector>,
    pub cropper: Arc<dyn FaceCropper>,
    pub aligner: Arc<dyn FaceAligner>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub clusterer: Arc<dyn FaceClusterer>,
    pub encryptor: Arc<dyn MetadataEncryptor>,
    pub uploader: Arc<dyn EmbeddingUploader>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("clusterer", &self.clusterer.method())
            .finish_non_exhaustive()
    }
}

/// State shared by every file processed in one sync run.
///
/// Counters are atomic because per-file pipelines update them from
/// several workers. The first recorded error wins.
pub struct SyncContext {
    pub token: String,
    pub owner_id: OwnerId,
    pub config: SyncConfig,
    /// When false, successfully processed files keep their previous
    /// `ml_version`, so a later full sync still picks them up.
    pub should_update_ml_version: bool,
    pub store: Arc<IndexStore>,
    pub services: Arc<Collaborators>,
    pub pool: WorkerPool,
    local_files: OnceCell<HashMap<FileId, FileMeta>>,
    synced_files: AtomicUsize,
    synced_faces: AtomicUsize,
    error: Mutex<Option<SyncFailure>>,
    library: Mutex<Option<LibraryMlData>>,
}

impl SyncContext {
    pub fn new(
        token: String,
        owner_id: OwnerId,
        config: SyncConfig,
        should_update_ml_version: bool,
        store: Arc<IndexStore>,
        services: Arc<Collaborators>,
    ) -> Self {
        let pool = WorkerPool::new(config.concurrency);
        Self {
            token,
            owner_id,
            config,
            should_update_ml_version,
            store,
            services,
            pool,
            local_files: OnceCell::new(),
            synced_files: AtomicUsize::new(0),
            synced_faces: AtomicUsize::new(0),
            error: Mutex::new(None),
            library: Mutex::new(None),
        }
    }

    /// Local files of this owner, fetched once per context.
    pub async fn local_files_map(&self) -> Result<&HashMap<FileId, FileMeta>> {
        self.local_files
            .get_or_try_init(|| async {
                let files =
                    self.services.files.list_local_files(self.owner_id).await?;
                let map: HashMap<_, _> = files
                    .into_iter()
                    .filter(|f| f.owner_id == self.owner_id)
                    .map(|f| (f.id, f))
                    .collect();
                debug!(
                    owner_id = self.owner_id,
                    files = map.len(),
                    "local files"
                );
                Ok::<_, Error>(map)
            })
            .await
    }

    pub fn record_file_synced(&self, faces: usize) {
        self.synced_files.fetch_add(1, Ordering::SeqCst);
        self.synced_faces.fetch_add(faces, Ordering::SeqCst);
    }

    /// Count a file whose failure was absorbed; it still consumes a slot.
    pub fn record_file_failed(&self) {
        self.synced_files.fetch_add(1, Ordering::SeqCst);
    }

    pub fn synced_files(&self) -> usize {
        self.synced_files.load(Ordering::SeqCst)
    }

    pub fn synced_faces(&self) -> usize {
        self.synced_faces.load(Ordering::SeqCst)
    }

    /// Record `err` unless an earlier error was already recorded.
    pub fn set_error(&self, err: &Error) {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| SyncFailure::from(err));
    }

    pub fn error(&self) -> Option<SyncFailure> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_library(&self, data: LibraryMlData) {
        *self.library.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(data);
    }

    pub fn library(&self) -> Option<LibraryMlData> {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release the context; logs what the run achieved.
    pub fn dispose(&self) {
        info!(
            owner_id = self.owner_id,
            files = self.synced_files(),
            faces = self.synced_faces(),
            local = !self.should_update_ml_version,
            "sync context closed"
        );
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("owner_id", &self.owner_id)
            .field("should_update_ml_version", &self.should_update_ml_version)
            .field("synced_files", &self.synced_files())
            .finish_non_exhaustive()
    }
}
