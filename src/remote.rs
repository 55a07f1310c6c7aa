//! Upload of a file's derived ML record.
//!
//! Encryption and transport are opaque collaborators; this module only
//! decides what is sent and in which shape.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    context::SyncContext,
    error::{Error, Result},
    types::{FaceDetection, FileId, FileMeta, FileMlRecord},
};

/// Tag identifying the producer of an uploaded record.
pub const CLIENT_TAG: &str = "facesync";

/// Ciphertext plus whatever the receiver needs to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub encrypted_data: Vec<u8>,
    pub decryption_header: Vec<u8>,
}

#[async_trait]
pub trait MetadataEncryptor: Send + Sync {
    async fn encrypt_metadata(
        &self,
        payload: &[u8],
        key: &str,
    ) -> Result<EncryptedBlob>;
}

/// Body of an embedding upload; binary fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEmbeddingRequest {
    pub file_id: FileId,
    pub encrypted_embedding: String,
    pub decryption_header: String,
    pub model: String,
}

#[async_trait]
pub trait EmbeddingUploader: Send + Sync {
    async fn put_embedding(
        &self,
        token: &str,
        request: PutEmbeddingRequest,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFace {
    pub face_id: String,
    pub embedding: Vec<f32>,
    pub detection: FaceDetection,
    pub score: f32,
}

/// Shape of the derived record as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFileMl {
    pub file_id: FileId,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub faces: Vec<ServerFace>,
    pub ml_version: u32,
    pub client: String,
}

/// Map a local record to its server shape. Faces without an embedding
/// are left out since the server has no use for them.
pub fn to_server_file_ml(record: &FileMlRecord) -> ServerFileMl {
    let faces = record
        .faces
        .iter()
        .filter_map(|face| {
            let embedding = face.embedding.clone()?;
            Some(ServerFace {
                face_id: face.id.clone(),
                embedding,
                detection: face.detection.clone(),
                score: face.detection.probability,
            })
        })
        .collect();
    ServerFileMl {
        file_id: record.file_id,
        width: record.image_dimensions.map(|d| d.width),
        height: record.image_dimensions.map(|d| d.height),
        faces,
        ml_version: record.ml_version,
        client: CLIENT_TAG.to_string(),
    }
}

/// Encrypt `record` with the file key and upload it.
pub async fn persist_on_server(
    ctx: &SyncContext,
    file: &FileMeta,
    record: &FileMlRecord,
) -> Result<()> {
    let payload = serde_json::to_vec(&to_server_file_ml(record))?;
    let blob = ctx
        .services
        .encryptor
        .encrypt_metadata(&payload, &file.key)
        .await?;
    if blob.encrypted_data.is_empty() {
        return Err(Error::Encryption(format!(
            "empty ciphertext for file {}",
            file.id
        )));
    }

    let request = PutEmbeddingRequest {
        file_id: file.id,
        encrypted_embedding: STANDARD.encode(&blob.encrypted_data),
        decryption_header: STANDARD.encode(&blob.decryption_header),
        model: ctx.config.embedding_model.clone(),
    };
    ctx.services.uploader.put_embedding(&ctx.token, request).await?;
    debug!(file_id = file.id, faces = record.faces.len(), "uploaded");
    Ok(())
}
