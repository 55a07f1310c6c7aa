//! In-memory collaborators for end-to-end sync tests.
//!
//! Test images are 64x64 PNGs. The red channel of pixel (0, 0) holds the
//! number of faces the fake detector reports, and a red value of 1 at
//! pixel (1, 0) makes the fake embedder fail for that image.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use facesync::{
    Collaborators,
    Error,
    IndexStore,
    LocalFileSource,
    MlSyncService,
    Result,
    SyncConfig,
    clustering::HierarchicalClusterer,
    crop::ImageFaceCropper,
    face::{FaceAligner, FaceDetector, FaceEmbedder},
    people::FaceClusterer,
    reader::{DecodedImage, FileDownloader, ReaderService, encode_png},
    remote::{
        EmbeddingUploader,
        EncryptedBlob,
        MetadataEncryptor,
        PutEmbeddingRequest,
    },
    types::{
        AlignedFace,
        BBox,
        ClusteringResults,
        FaceAlignment,
        FaceDetection,
        FaceEmbedding,
        FileId,
        FileMeta,
        LibraryMlData,
        OwnerId,
        Point,
    },
};
use image::{Rgba, RgbaImage};

pub const OWNER: OwnerId = 7;
pub const TOKEN: &str = "token";
pub const IMAGE_SIZE: u32 = 64;

/// Scripted failure for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    /// Download returns bytes that are not an image.
    Decode,
    SessionExpired,
    Network,
    /// The embedder rejects the file's faces.
    Embed,
    /// The upload is refused with a file-scoped error.
    Upload,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileSpec {
    pub faces: u8,
    pub fail: Option<Fail>,
}

/// Shared view of the fake remote library.
#[derive(Debug, Default)]
pub struct Library {
    files: Mutex<HashMap<FileId, (FileMeta, FileSpec)>>,
    listings: AtomicUsize,
}

impl Library {
    pub fn add(&self, id: FileId, faces: u8) {
        self.add_for(OWNER, id, faces);
    }

    pub fn add_for(&self, owner_id: OwnerId, id: FileId, faces: u8) {
        let meta = FileMeta {
            id,
            owner_id,
            title: Some(format!("IMG_{id:04}.png")),
            key: format!("key-{id}"),
        };
        self.files.lock().unwrap().insert(
            id,
            (
                meta,
                FileSpec {
                    faces,
                    fail: None,
                },
            ),
        );
    }

    pub fn remove(&self, id: FileId) {
        self.files.lock().unwrap().remove(&id);
    }

    pub fn fail(&self, id: FileId, fail: Option<Fail>) {
        if let Some((_, spec)) = self.files.lock().unwrap().get_mut(&id) {
            spec.fail = fail;
        }
    }

    pub fn meta(&self, id: FileId) -> FileMeta {
        self.files.lock().unwrap()[&id].0.clone()
    }

    pub fn spec(&self, id: FileId) -> Option<FileSpec> {
        self.files.lock().unwrap().get(&id).map(|(_, spec)| *spec)
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalFileSource for Library {
    async fn list_local_files(
        &self,
        _owner_id: OwnerId,
    ) -> Result<Vec<FileMeta>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .map(|(meta, _)| meta.clone())
            .collect())
    }
}

/// Render the test image for `spec`.
pub fn test_png(spec: FileSpec) -> Vec<u8> {
    let mut image =
        RgbaImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, Rgba([0, 0, 0, 255]));
    image.put_pixel(0, 0, Rgba([spec.faces, 0, 0, 255]));
    let embed_fails = spec.fail == Some(Fail::Embed);
    image.put_pixel(1, 0, Rgba([u8::from(embed_fails), 0, 0, 255]));
    encode_png(&image).unwrap()
}

pub struct Downloader {
    library: Arc<Library>,
    pub downloads: AtomicUsize,
}

#[async_trait]
impl FileDownloader for Downloader {
    async fn download(&self, _token: &str, file: &FileMeta) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let spec = self.library.spec(file.id).ok_or_else(|| Error::NotFound {
            kind: "file",
            name: file.id.to_string(),
        })?;
        match spec.fail {
            Some(Fail::Decode) => Ok(b"definitely not a png".to_vec()),
            Some(Fail::SessionExpired) => Err(Error::SessionExpired),
            Some(Fail::Network) => Err(Error::Network("offline".into())),
            _ => Ok(test_png(spec)),
        }
    }
}

/// Reports as many faces as pixel (0, 0) says, side by side.
pub struct Detector;

#[async_trait]
impl FaceDetector for Detector {
    async fn detect(&self, image: &DecodedImage) -> Result<Vec<FaceDetection>> {
        let count = image.as_rgba().get_pixel(0, 0)[0];
        Ok((0..count)
            .map(|i| {
                let x = 2.0 + 20.0 * f32::from(i);
                FaceDetection {
                    bbox: BBox {
                        x,
                        y: 20.0,
                        width: 12.0,
                        height: 12.0,
                    },
                    landmarks: vec![Point { x: x + 6.0, y: 26.0 }],
                    probability: 0.9,
                }
            })
            .collect())
    }
}

pub struct Aligner;

#[async_trait]
impl FaceAligner for Aligner {
    async fn align(
        &self,
        image: &DecodedImage,
        detection: &FaceDetection,
    ) -> Result<AlignedFace> {
        let b = &detection.bbox;
        let marker = f32::from(image.as_rgba().get_pixel(1, 0)[0]);
        Ok(AlignedFace {
            alignment: FaceAlignment {
                affine_matrix: [
                    [1.0, 0.0, -b.x],
                    [0.0, 1.0, -b.y],
                    [0.0, 0.0, 1.0],
                ],
                center: Point {
                    x: b.x + b.width / 2.0,
                    y: b.y + b.height / 2.0,
                },
                size: b.width,
                rotation: 0.0,
            },
            pixels: vec![marker],
        })
    }
}

/// Every face gets the same embedding, so all faces form one person.
#[derive(Default)]
pub struct Embedder {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

#[async_trait]
impl FaceEmbedder for Embedder {
    async fn embed(&self, faces: &[AlignedFace]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if faces.iter().any(|f| f.pixels.first() == Some(&1.0)) {
            return Err(Error::Inference("embedder rejected face".into()));
        }
        Ok(faces.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

pub struct Encryptor;

#[async_trait]
impl MetadataEncryptor for Encryptor {
    async fn encrypt_metadata(
        &self,
        payload: &[u8],
        key: &str,
    ) -> Result<EncryptedBlob> {
        let mut data = key.as_bytes().to_vec();
        data.extend_from_slice(payload);
        Ok(EncryptedBlob {
            encrypted_data: data,
            decryption_header: b"header".to_vec(),
        })
    }
}

pub struct Uploader {
    library: Arc<Library>,
    pub requests: Mutex<Vec<PutEmbeddingRequest>>,
}

impl Uploader {
    pub fn uploaded_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<_> =
            self.requests.lock().unwrap().iter().map(|r| r.file_id).collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl EmbeddingUploader for Uploader {
    async fn put_embedding(
        &self,
        _token: &str,
        request: PutEmbeddingRequest,
    ) -> Result<()> {
        let fail = self.library.spec(request.file_id).and_then(|s| s.fail);
        if fail == Some(Fail::Upload) {
            return Err(Error::Upload("server refused record".into()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

/// The default clusterer, counting how often it runs. It can be switched
/// to fail every run.
pub struct CountingClusterer {
    inner: HierarchicalClusterer,
    pub runs: AtomicUsize,
    pub broken: AtomicBool,
}

impl CountingClusterer {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

#[async_trait]
impl FaceClusterer for CountingClusterer {
    fn method(&self) -> &str {
        self.inner.method()
    }

    async fn cluster(
        &self,
        faces: &[FaceEmbedding],
        prior: &LibraryMlData,
    ) -> Result<ClusteringResults> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Clustering("clusterer is broken".into()));
        }
        self.inner.cluster(faces, prior).await
    }
}

/// A store on disk plus every fake, wired into a service.
pub struct Harness {
    pub _tmp: tempfile::TempDir,
    pub store: Arc<IndexStore>,
    pub library: Arc<Library>,
    pub downloader: Arc<Downloader>,
    pub embedder: Arc<Embedder>,
    pub uploader: Arc<Uploader>,
    pub clusterer: Arc<CountingClusterer>,
    pub service: MlSyncService,
}

/// Config for tests: deterministic indexing and a small pool.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        concurrency: 2,
        index_probability: 0.0,
        ..SyncConfig::default()
    }
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_embed_delay(config, Duration::ZERO)
    }

    pub fn with_embed_delay(config: SyncConfig, delay: Duration) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store =
            Arc::new(IndexStore::open(&tmp.path().join("index.redb")).unwrap());
        Self::build(config, delay, tmp, store)
    }

    /// A fresh library and fakes on top of an existing store.
    pub fn with_store(config: SyncConfig, store: Arc<IndexStore>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self::build(config, Duration::ZERO, tmp, store)
    }

    fn build(
        config: SyncConfig,
        delay: Duration,
        tmp: tempfile::TempDir,
        store: Arc<IndexStore>,
    ) -> Self {
        let library = Arc::new(Library::default());
        let downloader = Arc::new(Downloader {
            library: library.clone(),
            downloads: AtomicUsize::new(0),
        });
        let embedder = Arc::new(Embedder {
            delay,
            calls: AtomicUsize::new(0),
        });
        let uploader = Arc::new(Uploader {
            library: library.clone(),
            requests: Mutex::new(Vec::new()),
        });
        let clusterer = Arc::new(CountingClusterer {
            inner: HierarchicalClusterer::from_config(&config),
            runs: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
        });

        let services = Collaborators {
            files: library.clone(),
            reader: ReaderService::new(downloader.clone()),
            detector: Arc::new(Detector),
            cropper: Arc::new(ImageFaceCropper::default()),
            aligner: Arc::new(Aligner),
            embedder: embedder.clone(),
            clusterer: clusterer.clone(),
            encryptor: Arc::new(Encryptor),
            uploader: uploader.clone(),
        };
        let service = MlSyncService::new(store.clone(), services, config);

        Self {
            _tmp: tmp,
            store,
            library,
            downloader,
            embedder,
            uploader,
            clusterer,
            service,
        }
    }

    pub fn downloads(&self) -> usize {
        self.downloader.downloads.load(Ordering::SeqCst)
    }
}
