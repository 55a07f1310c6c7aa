use serde::{Deserialize, Serialize};

/// Numeric identifier of a file in the remote library.
pub type FileId = u64;

/// Numeric identifier of the library owner.
pub type OwnerId = i64;

/// What the core knows about a file in the user's library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: FileId,
    pub owner_id: OwnerId,
    pub title: Option<String>,
    /// Per-file key used to encrypt derived metadata before upload.
    pub key: String,
}

impl FileMeta {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("<untitled>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned box as origin plus size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn x_max(&self) -> f32 {
        self.x + self.width
    }

    pub fn y_max(&self) -> f32 {
        self.y + self.height
    }

    /// Divide every coordinate by the image size.
    pub fn to_relative(&self, dims: Dimensions) -> Self {
        let (w, h) = (dims.width as f32, dims.height as f32);
        Self {
            x: self.x / w,
            y: self.y / h,
            width: self.width / w,
            height: self.height / h,
        }
    }

    /// Inverse of [`BBox::to_relative`].
    pub fn to_absolute(&self, dims: Dimensions) -> Self {
        let (w, h) = (dims.width as f32, dims.height as f32);
        Self {
            x: self.x * w,
            y: self.y * h,
            width: self.width * w,
            height: self.height * h,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BBox,
    pub landmarks: Vec<Point>,
    pub probability: f32,
}

impl FaceDetection {
    pub fn to_relative(&self, dims: Dimensions) -> Self {
        let (w, h) = (dims.width as f32, dims.height as f32);
        Self {
            bbox: self.bbox.to_relative(dims),
            landmarks: self
                .landmarks
                .iter()
                .map(|p| Point {
                    x: p.x / w,
                    y: p.y / h,
                })
                .collect(),
            probability: self.probability,
        }
    }

    pub fn to_absolute(&self, dims: Dimensions) -> Self {
        let (w, h) = (dims.width as f32, dims.height as f32);
        Self {
            bbox: self.bbox.to_absolute(dims),
            landmarks: self
                .landmarks
                .iter()
                .map(|p| Point {
                    x: p.x * w,
                    y: p.y * h,
                })
                .collect(),
            probability: self.probability,
        }
    }
}

/// Affine transform mapping image coordinates onto the aligned face.
///
/// Row-major 3x3; the last row is `[0, 0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAlignment {
    pub affine_matrix: [[f32; 3]; 3],
    pub center: Point,
    pub size: f32,
    pub rotation: f32,
}

impl FaceAlignment {
    /// Rewrite the transform so it takes relative image coordinates.
    ///
    /// With `x = xr * w`, `M * [x, y, 1]` equals `M' * [xr, yr, 1]` where
    /// `M'` is `M` with its first column scaled by `w` and second by `h`.
    pub fn to_relative(&self, dims: Dimensions) -> Self {
        let (w, h) = (dims.width as f32, dims.height as f32);
        let mut m = self.affine_matrix;
        for row in &mut m {
            row[0] *= w;
            row[1] *= h;
        }
        Self {
            affine_matrix: m,
            center: Point {
                x: self.center.x / w,
                y: self.center.y / h,
            },
            size: self.size / w.max(h),
            rotation: self.rotation,
        }
    }
}

/// Reference to a stored face crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRef {
    /// Key of the crop in the face crop store.
    pub key: String,
    /// Region of the source image the crop covers, in relative coordinates.
    pub image_box: BBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub id: String,
    pub file_id: FileId,
    pub detection: FaceDetection,
    #[serde(default)]
    pub alignment: Option<FaceAlignment>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub crop: Option<CropRef>,
}

/// Per-file derived ML state, one per known file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMlRecord {
    pub file_id: FileId,
    /// Version of the pipeline that produced `faces`; 0 means never run.
    pub ml_version: u32,
    pub error_count: u32,
    #[serde(default)]
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub image_dimensions: Option<Dimensions>,
    #[serde(default)]
    pub faces: Vec<Face>,
}

impl FileMlRecord {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            ml_version: 0,
            error_count: 0,
            last_error_message: None,
            image_dimensions: None,
            faces: Vec::new(),
        }
    }

    pub fn is_synced(&self, target_version: u32) -> bool {
        self.ml_version == target_version && self.error_count == 0
    }

    pub fn needs_sync(
        &self,
        target_version: u32,
        max_error_count: u32,
    ) -> bool {
        needs_sync(
            self.ml_version,
            self.error_count,
            target_version,
            max_error_count,
        )
    }
}

/// Out-of-sync predicate shared by records and the compact sync-state index.
pub fn needs_sync(
    ml_version: u32,
    error_count: u32,
    target_version: u32,
    max_error_count: u32,
) -> bool {
    ml_version != target_version && error_count < max_error_count
}

/// Result of one clustering pass; both fields hold face ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringResults {
    pub clusters: Vec<Vec<String>>,
    pub noise: Vec<String>,
}

/// Library-wide aggregate state, rewritten as a whole on every indexing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryMlData {
    #[serde(default)]
    pub face_clustering_method: Option<String>,
    #[serde(default)]
    pub face_clustering_results: Option<ClusteringResults>,
    /// Number of faces considered by the last clustering pass.
    #[serde(default)]
    pub clustered_face_count: usize,
    /// Unix seconds of the last clustering pass.
    #[serde(default)]
    pub updated_at: u64,
}

impl LibraryMlData {
    pub fn cluster_count(&self) -> Option<usize> {
        self.face_clustering_results
            .as_ref()
            .map(|r| r.clusters.len())
    }

    pub fn noise_count(&self) -> Option<usize> {
        self.face_clustering_results.as_ref().map(|r| r.noise.len())
    }
}

/// One embedded face, as fed to the clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub face_id: String,
    pub file_id: FileId,
    pub embedding: Vec<f32>,
}

/// Encoded crop image for one face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    /// PNG bytes.
    pub image: Vec<u8>,
    /// Region of the source image the crop covers, in absolute pixels.
    pub image_box: BBox,
}

/// Face image warped into the embedder's input space.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFace {
    pub alignment: FaceAlignment,
    pub pixels: Vec<f32>,
}
