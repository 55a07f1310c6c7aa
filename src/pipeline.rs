use std::time::Instant;

use tracing::{debug, info, warn};

use crate::{
    context::SyncContext,
    error::{Error, Result},
    face::analyze_faces,
    remote::persist_on_server,
    types::{FileId, FileMeta, FileMlRecord},
};

/// Result of one file's pipeline after error handling.
#[derive(Debug)]
pub enum FileOutcome {
    Synced(FileMlRecord),
    /// The file failed with a file-scoped error, already recorded on its
    /// stored record.
    Failed(Error),
}

/// Derive, upload and store the ML record of one file.
///
/// A file already at the target version is returned untouched. On any
/// failure nothing is written, so the stored record keeps its previous
/// `ml_version` and face crops.
pub async fn sync_file(
    ctx: &SyncContext,
    file: &FileMeta,
    local_bytes: Option<&[u8]>,
) -> Result<FileMlRecord> {
    let old = ctx
        .store
        .get_file(file.id)?
        .unwrap_or_else(|| FileMlRecord::new(file.id));
    if old.ml_version == ctx.config.ml_version {
        return Ok(old);
    }

    let mut record = FileMlRecord::new(file.id);
    record.ml_version = if ctx.should_update_ml_version {
        ctx.config.ml_version
    } else {
        old.ml_version
    };

    let started = Instant::now();
    let image = ctx
        .services
        .reader
        .get_image(&ctx.token, file, local_bytes)
        .await?;
    let crops = analyze_faces(ctx, &image, &mut record).await?;
    drop(image);

    record.error_count = 0;
    record.last_error_message = None;
    persist_on_server(ctx, file, &record).await?;
    ctx.store.put_file_with_crops(&record, &crops)?;

    debug!(
        file_id = file.id,
        faces = record.faces.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "file synced"
    );
    Ok(record)
}

/// Run [`sync_file`] and absorb file-scoped failures.
///
/// Fatal errors are returned as `Err` without touching the file's record;
/// everything else is persisted against the file and reported as
/// [`FileOutcome::Failed`].
pub async fn sync_file_with_error_handler(
    ctx: &SyncContext,
    file: &FileMeta,
    local_bytes: Option<&[u8]>,
) -> Result<FileOutcome> {
    info!(file_id = file.id, title = file.display_title(), "indexing");
    match sync_file(ctx, file, local_bytes).await {
        Ok(record) => {
            ctx.record_file_synced(record.faces.len());
            Ok(FileOutcome::Synced(record))
        }
        Err(e) if e.is_fatal() => {
            warn!(file_id = file.id, "sync aborted: {e}");
            Err(e)
        }
        Err(e) => {
            warn!(file_id = file.id, "file sync failed: {e}");
            persist_file_sync_error(ctx, file.id, &e);
            ctx.record_file_failed();
            Ok(FileOutcome::Failed(e))
        }
    }
}

/// Bump the error counter of a file and remember the message.
///
/// Failures here are logged and swallowed.
pub fn persist_file_sync_error(
    ctx: &SyncContext,
    file_id: FileId,
    err: &Error,
) {
    let message = err.to_string();
    let outcome = ctx.store.upsert_file_with(file_id, |existing| {
        let mut record =
            existing.unwrap_or_else(|| FileMlRecord::new(file_id));
        record.error_count = record.error_count.saturating_add(1);
        record.last_error_message = Some(message);
        record
    });
    if let Err(store_err) = outcome {
        warn!(file_id, "could not record sync error: {store_err}");
    }
}
