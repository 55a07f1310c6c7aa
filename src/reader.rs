use std::{io::Cursor, sync::Arc};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbaImage};
use tracing::debug;

use crate::{
    error::{Error, Result},
    types::{Dimensions, FileMeta},
};

/// Fetches the original bytes of a remote file.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    async fn download(&self, token: &str, file: &FileMeta) -> Result<Vec<u8>>;
}

/// A decoded RGBA bitmap. Dropping it releases the pixel buffer.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    image: RgbaImage,
}

impl DecodedImage {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width(),
            height: self.height(),
        }
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.image
    }
}

/// Decode PNG or JPEG bytes into an RGBA bitmap.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| Error::Decode(e.to_string()))?
        .to_rgba8();
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Decode("image has no pixels".into()));
    }
    Ok(DecodedImage::new(image))
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| Error::Decode(e.to_string()))?;
    Ok(buf)
}

/// Produces a decoded image for a file, from caller-supplied bytes when
/// available and otherwise by downloading it.
#[derive(Clone)]
pub struct ReaderService {
    downloader: Arc<dyn FileDownloader>,
}

impl ReaderService {
    pub fn new(downloader: Arc<dyn FileDownloader>) -> Self {
        Self { downloader }
    }

    pub async fn get_image(
        &self,
        token: &str,
        file: &FileMeta,
        local_bytes: Option<&[u8]>,
    ) -> Result<DecodedImage> {
        let bytes = match local_bytes {
            Some(bytes) => bytes.to_vec(),
            None => {
                debug!(file_id = file.id, "downloading original");
                self.downloader.download(token, file).await?
            }
        };
        tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| Error::Worker(e.to_string()))?
    }
}

impl std::fmt::Debug for ReaderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::Rgba;

    use super::*;

    struct CountingDownloader {
        bytes: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FileDownloader for CountingDownloader {
        async fn download(
            &self,
            _token: &str,
            _file: &FileMeta,
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.bytes.clone())
        }
    }

    fn file() -> FileMeta {
        FileMeta {
            id: 1,
            owner_id: 1,
            title: None,
            key: "k".into(),
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([9, 8, 7, 255]));
        encode_png(&image).unwrap()
    }

    #[test]
    fn decode_png() {
        let image = decode_image(&png(4, 3)).unwrap();
        assert_eq!(
            image.dimensions(),
            Dimensions {
                width: 4,
                height: 3
            }
        );
        assert_eq!(image.as_rgba().get_pixel(0, 0), &Rgba([9, 8, 7, 255]));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_image(b"not an image").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn local_bytes_skip_download() {
        let downloader = Arc::new(CountingDownloader {
            bytes: png(2, 2),
            calls: AtomicUsize::new(0),
        });
        let reader = ReaderService::new(downloader.clone());

        let local = png(5, 5);
        let image = reader.get_image("t", &file(), Some(&local)).await.unwrap();
        assert_eq!(image.width(), 5);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);

        let image = reader.get_image("t", &file(), None).await.unwrap();
        assert_eq!(image.width(), 2);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
    }
}
