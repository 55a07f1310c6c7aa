use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::info;

use crate::{
    context::SyncContext,
    error::Result,
    index_store::IndexStore,
    types::{ClusteringResults, FaceEmbedding, LibraryMlData},
};

/// Groups face embeddings into people.
#[async_trait]
pub trait FaceClusterer: Send + Sync {
    /// Name recorded as the library's clustering method.
    fn method(&self) -> &str;

    async fn cluster(
        &self,
        faces: &[FaceEmbedding],
        prior: &LibraryMlData,
    ) -> Result<ClusteringResults>;
}

/// Recompute clusters over every stored embedding and overwrite the
/// library metadata with the result.
pub async fn index_people(
    store: &IndexStore,
    clusterer: &dyn FaceClusterer,
) -> Result<LibraryMlData> {
    let started = Instant::now();
    let mut library = store.get_library_data()?.unwrap_or_default();
    let faces = store.all_face_embeddings()?;

    let results = clusterer.cluster(&faces, &library).await?;
    info!(
        faces = faces.len(),
        clusters = results.clusters.len(),
        noise = results.noise.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "people index rebuilt"
    );

    library.face_clustering_method = Some(clusterer.method().to_string());
    library.face_clustering_results = Some(results);
    library.clustered_face_count = faces.len();
    library.updated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    store.put_library_data(&library)?;
    Ok(library)
}

/// Run the cross-file indexer for a sync run and keep its result on the
/// context.
pub async fn sync_index(ctx: &SyncContext) -> Result<()> {
    let library =
        index_people(&ctx.store, ctx.services.clusterer.as_ref()).await?;
    ctx.set_library(library);
    Ok(())
}
