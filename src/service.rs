use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::SyncConfig,
    context::{Collaborators, SyncContext},
    error::{Error, Result, SyncFailure},
    face,
    index_store::{FILES_INDEX, IndexStore},
    people::sync_index,
    pipeline::{FileOutcome, sync_file_with_error_handler},
    types::{FaceCrop, FileMeta, FileMlRecord, OwnerId},
};

/// Summary of one [`MlSyncService::sync`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub files_out_of_sync: usize,
    pub files_synced: usize,
    pub faces_synced: usize,
    pub cluster_count: Option<usize>,
    pub noise_count: Option<usize>,
    /// Set when the batch was aborted or the people index failed.
    pub error: Option<SyncFailure>,
}

/// Coordinates sync runs for one owner at a time.
#[derive(Default)]
struct RunSlot {
    /// Bumped after every finished run.
    generation: AtomicU64,
    last: tokio::sync::Mutex<Option<SyncResult>>,
}

struct Inner {
    store: Arc<IndexStore>,
    services: Arc<Collaborators>,
    config: SyncConfig,
    runs: Mutex<HashMap<OwnerId, Arc<RunSlot>>>,
    local: tokio::sync::Mutex<Option<Arc<SyncContext>>>,
}

/// Entry point of the sync engine.
///
/// Cloning is cheap; clones share the in-flight run bookkeeping and the
/// local sync context.
#[derive(Clone)]
pub struct MlSyncService {
    inner: Arc<Inner>,
}

impl MlSyncService {
    pub fn new(
        store: Arc<IndexStore>,
        services: Collaborators,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                services: Arc::new(services),
                config,
                runs: Mutex::new(HashMap::new()),
                local: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Bring the next batch of out-of-sync files up to the target version.
    ///
    /// A call made while another sync for the same owner is running waits
    /// for that run and returns its summary.
    pub async fn sync(
        &self,
        token: &str,
        owner_id: OwnerId,
    ) -> Result<SyncResult> {
        if token.is_empty() {
            return Err(Error::MissingToken);
        }

        let slot = self.run_slot(owner_id);
        let seen = slot.generation.load(Ordering::SeqCst);
        let mut last = slot.last.lock().await;
        if slot.generation.load(Ordering::SeqCst) != seen
            && let Some(result) = last.as_ref()
        {
            info!(owner_id, "joined in-flight sync");
            return Ok(result.clone());
        }

        let outcome = self.run_sync(token, owner_id).await;
        *last = outcome.as_ref().ok().cloned();
        slot.generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn run_slot(&self, owner_id: OwnerId) -> Arc<RunSlot> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(owner_id)
            .or_default()
            .clone()
    }

    fn new_context(
        &self,
        token: &str,
        owner_id: OwnerId,
        should_update_ml_version: bool,
    ) -> SyncContext {
        SyncContext::new(
            token.to_string(),
            owner_id,
            self.inner.config.clone(),
            should_update_ml_version,
            self.inner.store.clone(),
            self.inner.services.clone(),
        )
    }

    async fn run_sync(
        &self,
        token: &str,
        owner_id: OwnerId,
    ) -> Result<SyncResult> {
        let started = Instant::now();
        let ctx = Arc::new(self.new_context(token, owner_id, true));

        sync_local_files(&ctx).await?;
        let files = get_out_of_sync_files(&ctx).await?;
        let files_out_of_sync = files.len();
        if !files.is_empty() {
            sync_files(&ctx, files).await?;
        }

        if should_index(&ctx, files_out_of_sync) {
            if let Err(e) = sync_index(&ctx).await {
                warn!(owner_id, "people index failed: {e}");
                ctx.set_error(&e);
            }
        }

        let library = ctx.library();
        let result = SyncResult {
            files_out_of_sync,
            files_synced: ctx.synced_files(),
            faces_synced: ctx.synced_faces(),
            cluster_count: library.as_ref().and_then(|l| l.cluster_count()),
            noise_count: library.as_ref().and_then(|l| l.noise_count()),
            error: ctx.error(),
        };
        info!(
            owner_id,
            out_of_sync = result.files_out_of_sync,
            files = result.files_synced,
            faces = result.faces_synced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );
        ctx.dispose();
        Ok(result)
    }

    /// Process one file right away, for example just after it was added.
    ///
    /// Runs on a long-lived local context that never advances
    /// `ml_version`, so the next full sync still covers the file. A
    /// file-scoped failure is recorded against the file and returned.
    pub async fn sync_local_file(
        &self,
        token: &str,
        owner_id: OwnerId,
        file: &FileMeta,
        local_bytes: Option<&[u8]>,
    ) -> Result<FileMlRecord> {
        let ctx = self.local_context(token, owner_id).await;
        let outcome =
            sync_file_with_error_handler(&ctx, file, local_bytes).await;

        if ctx.synced_files() >= ctx.config.local_batch_size {
            self.close_local_sync_context().await;
        }

        match outcome? {
            FileOutcome::Synced(record) => Ok(record),
            FileOutcome::Failed(e) => Err(e),
        }
    }

    async fn local_context(
        &self,
        token: &str,
        owner_id: OwnerId,
    ) -> Arc<SyncContext> {
        let mut local = self.inner.local.lock().await;
        if let Some(ctx) = local.as_ref()
            && ctx.owner_id == owner_id
        {
            return ctx.clone();
        }
        if let Some(previous) = local.take() {
            previous.dispose();
        }
        info!(owner_id, "creating local sync context");
        let ctx = Arc::new(self.new_context(token, owner_id, false));
        *local = Some(ctx.clone());
        ctx
    }

    /// Tear down the local sync context, if one is open.
    pub async fn close_local_sync_context(&self) {
        if let Some(ctx) = self.inner.local.lock().await.take() {
            ctx.dispose();
        }
    }

    /// Re-derive the stored crop of `face_id` from its original image.
    pub async fn regenerate_face_crop(
        &self,
        token: &str,
        owner_id: OwnerId,
        face_id: &str,
    ) -> Result<FaceCrop> {
        let ctx = self.new_context(token, owner_id, true);
        face::regenerate_face_crop(&ctx, face_id).await
    }
}

impl std::fmt::Debug for MlSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlSyncService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Reconcile the store with the local library: new files get a fresh
/// record, files gone from the library lose theirs.
async fn sync_local_files(ctx: &SyncContext) -> Result<()> {
    let started = Instant::now();
    let local = ctx.local_files_map().await?;
    let stored: HashSet<_> =
        ctx.store.get_all_file_ids()?.into_iter().collect();

    let mut new_ids: Vec<_> =
        local.keys().filter(|id| !stored.contains(id)).copied().collect();
    new_ids.sort_unstable();
    let mut removed_ids: Vec<_> = stored
        .iter()
        .filter(|id| !local.contains_key(id))
        .copied()
        .collect();
    removed_ids.sort_unstable();

    if let Some(version) = ctx.store.sync_local_files(&new_ids, &removed_ids)? {
        info!(
            new = new_ids.len(),
            removed = removed_ids.len(),
            version,
            "reconciled local files"
        );
    }
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sync_local_files"
    );
    Ok(())
}

/// The next batch of files to process, resolved against the local library.
async fn get_out_of_sync_files(ctx: &SyncContext) -> Result<Vec<FileMeta>> {
    let ids = ctx.store.get_file_ids_needing_sync(
        ctx.config.batch_size,
        ctx.config.ml_version,
        ctx.config.max_error_count,
    )?;
    let local = ctx.local_files_map().await?;
    Ok(ids
        .into_iter()
        .filter_map(|id| {
            let file = local.get(&id).cloned();
            if file.is_none() {
                warn!(file_id = id, "out-of-sync file missing locally");
            }
            file
        })
        .collect())
}

/// Drive the batch through the worker pool, then signal completion by
/// bumping the files index version.
async fn sync_files(
    ctx: &Arc<SyncContext>,
    files: Vec<FileMeta>,
) -> Result<()> {
    let worker_ctx = ctx.clone();
    let report = ctx
        .pool
        .run(files, move |file| {
            let ctx = worker_ctx.clone();
            async move {
                sync_file_with_error_handler(&ctx, &file, None)
                    .await
                    .map(|_| ())
            }
        })
        .await;

    if let Some(e) = &report.error {
        warn!(skipped = report.skipped, "batch aborted: {e}");
        ctx.set_error(e);
    }
    info!(
        completed = report.completed,
        faces = ctx.synced_faces(),
        "batch drained"
    );

    ctx.store.increment_index_version(FILES_INDEX)?;
    Ok(())
}

/// Whether to run the people index after this batch: always once the
/// library is fully synced, and at random after a full batch.
fn should_index(ctx: &SyncContext, files_out_of_sync: usize) -> bool {
    files_out_of_sync == 0
        || (ctx.synced_files() == ctx.config.batch_size
            && rand::random::<f64>() < ctx.config.index_probability)
}
