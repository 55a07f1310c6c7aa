//! Per-file face stages: detection, crops, alignment, embedding and the
//! final conversion of geometry to image-relative coordinates.
//!
//! Raw inference is delegated to the traits below; this module owns the
//! order of the stages and the bookkeeping on [`FileMlRecord`].

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    context::SyncContext,
    error::{Error, Result},
    reader::DecodedImage,
    types::{
        AlignedFace,
        CropRef,
        Dimensions,
        Face,
        FaceCrop,
        FaceDetection,
        FileId,
        FileMlRecord,
    },
};

/// Finds faces in a decoded image; boxes are in absolute pixels.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &DecodedImage) -> Result<Vec<FaceDetection>>;
}

/// Cuts a displayable crop around a detected face.
#[async_trait]
pub trait FaceCropper: Send + Sync {
    async fn crop(
        &self,
        image: &DecodedImage,
        detection: &FaceDetection,
    ) -> Result<FaceCrop>;
}

/// Warps a detected face into the embedder's canonical pose.
#[async_trait]
pub trait FaceAligner: Send + Sync {
    async fn align(
        &self,
        image: &DecodedImage,
        detection: &FaceDetection,
    ) -> Result<AlignedFace>;
}

/// Computes one embedding per aligned face, in input order.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, faces: &[AlignedFace]) -> Result<Vec<Vec<f32>>>;
}

/// Prefix shared by the ids of every face of `file_id`.
pub fn face_id_prefix(file_id: FileId) -> String {
    format!("{file_id}_")
}

/// Deterministic face id from the file id and the relative box corners.
pub fn face_id(
    file_id: FileId,
    detection: &FaceDetection,
    dims: Dimensions,
) -> String {
    let rel = detection.bbox.to_relative(dims);
    let scaled = |v: f32| (v.clamp(0.0, 1.0) * 100_000.0).round() as u32;
    format!(
        "{}{:05}_{:05}_{:05}_{:05}",
        face_id_prefix(file_id),
        scaled(rel.x),
        scaled(rel.y),
        scaled(rel.x_max()),
        scaled(rel.y_max()),
    )
}

/// Recover the file id from a face id.
pub fn parse_face_file_id(face_id: &str) -> Option<FileId> {
    face_id.split_once('_')?.0.parse().ok()
}

/// Turn raw detections into faces, keeping only the first detection for
/// each face id.
pub fn faces_from_detections(
    file_id: FileId,
    detections: Vec<FaceDetection>,
    dims: Dimensions,
) -> Vec<Face> {
    let mut seen = HashSet::new();
    detections
        .into_iter()
        .filter_map(|detection| {
            let id = face_id(file_id, &detection, dims);
            if !seen.insert(id.clone()) {
                warn!(file_id, face_id = %id, "dropping duplicate detection");
                return None;
            }
            Some(Face {
                id,
                file_id,
                detection,
                alignment: None,
                embedding: None,
                crop: None,
            })
        })
        .collect()
}

pub async fn sync_file_face_detections(
    ctx: &SyncContext,
    image: &DecodedImage,
    record: &mut FileMlRecord,
) -> Result<()> {
    let dims = image.dimensions();
    let detections = ctx.services.detector.detect(image).await?;
    debug!(file_id = record.file_id, faces = detections.len(), "detected");

    record.image_dimensions = Some(dims);
    record.faces = faces_from_detections(record.file_id, detections, dims);
    Ok(())
}

/// Crop every face. The encoded crops are returned keyed by face id and
/// only stored once the whole record is.
pub async fn sync_file_face_crops(
    ctx: &SyncContext,
    image: &DecodedImage,
    record: &mut FileMlRecord,
) -> Result<Vec<(String, Vec<u8>)>> {
    let dims = image.dimensions();
    let mut crops = Vec::with_capacity(record.faces.len());
    for face in &mut record.faces {
        let crop = ctx.services.cropper.crop(image, &face.detection).await?;
        face.crop = Some(CropRef {
            key: face.id.clone(),
            image_box: crop.image_box.to_relative(dims),
        });
        crops.push((face.id.clone(), crop.image));
    }
    Ok(crops)
}

pub async fn sync_file_face_alignments(
    ctx: &SyncContext,
    image: &DecodedImage,
    record: &mut FileMlRecord,
) -> Result<Vec<AlignedFace>> {
    let mut aligned = Vec::with_capacity(record.faces.len());
    for face in &mut record.faces {
        let aligned_face =
            ctx.services.aligner.align(image, &face.detection).await?;
        face.alignment = Some(aligned_face.alignment.clone());
        aligned.push(aligned_face);
    }
    Ok(aligned)
}

pub async fn sync_file_face_embeddings(
    ctx: &SyncContext,
    record: &mut FileMlRecord,
    aligned: &[AlignedFace],
) -> Result<()> {
    let embeddings = ctx.services.embedder.embed(aligned).await?;
    if embeddings.len() != record.faces.len() {
        return Err(Error::Inference(format!(
            "embedder returned {} vectors for {} faces",
            embeddings.len(),
            record.faces.len()
        )));
    }
    for (face, embedding) in record.faces.iter_mut().zip(embeddings) {
        face.embedding = Some(embedding);
    }
    Ok(())
}

/// Rewrite detections and alignments relative to the image size, so the
/// record does not depend on the resolution the image was decoded at.
pub fn make_relative_detections(record: &mut FileMlRecord) -> Result<()> {
    let dims = record.image_dimensions.ok_or_else(|| {
        Error::Inference(format!(
            "file {} has faces but no image dimensions",
            record.file_id
        ))
    })?;
    for face in &mut record.faces {
        face.detection = face.detection.to_relative(dims);
        face.alignment = face.alignment.as_ref().map(|a| a.to_relative(dims));
    }
    Ok(())
}

/// Run every face stage for one decoded image, stopping after detection
/// when no face was found. Returns the face crops still to be stored.
pub async fn analyze_faces(
    ctx: &SyncContext,
    image: &DecodedImage,
    record: &mut FileMlRecord,
) -> Result<Vec<(String, Vec<u8>)>> {
    let started = std::time::Instant::now();
    sync_file_face_detections(ctx, image, record).await?;

    if record.faces.is_empty() {
        return Ok(Vec::new());
    }
    let crops = sync_file_face_crops(ctx, image, record).await?;
    let aligned = sync_file_face_alignments(ctx, image, record).await?;
    sync_file_face_embeddings(ctx, record, &aligned).await?;
    make_relative_detections(record)?;

    debug!(
        file_id = record.file_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "face analysis done"
    );
    Ok(crops)
}

/// Re-derive and store the crop of an already indexed face.
pub async fn regenerate_face_crop(
    ctx: &SyncContext,
    face_id: &str,
) -> Result<FaceCrop> {
    let not_found = || Error::NotFound {
        kind: "face",
        name: face_id.to_string(),
    };
    let file_id = parse_face_file_id(face_id).ok_or_else(not_found)?;
    let record = ctx.store.get_file(file_id)?.ok_or_else(not_found)?;
    let face = record
        .faces
        .iter()
        .find(|f| f.id == face_id)
        .ok_or_else(not_found)?;

    let file = ctx
        .local_files_map()
        .await?
        .get(&file_id)
        .cloned()
        .ok_or_else(|| Error::NotFound {
            kind: "file",
            name: file_id.to_string(),
        })?;

    let image = ctx
        .services
        .reader
        .get_image(&ctx.token, &file, None)
        .await?;
    let detection = face.detection.to_absolute(image.dimensions());
    let crop = ctx.services.cropper.crop(&image, &detection).await?;
    ctx.store.put_face_crop(face_id, &crop.image)?;
    Ok(crop)
}
