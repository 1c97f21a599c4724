use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::application::ports::FrameCodec;
use crate::domain::errors::{DomainError, DomainResult};

pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl FrameCodec for JpegCodec {
    fn decode(&self, jpeg: &[u8]) -> DomainResult<RgbImage> {
        image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| DomainError::OperationFailed(format!("jpeg decode: {e}")))
    }

    fn encode(&self, image: &RgbImage) -> DomainResult<Vec<u8>> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
            .map_err(|e| DomainError::OperationFailed(format!("jpeg encode: {e}")))?;
        Ok(jpeg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frames_decode_back_to_the_same_size() {
        let codec = JpegCodec::new(80);
        let img = RgbImage::from_pixel(32, 24, image::Rgb([200, 30, 30]));
        let jpeg = codec.encode(&img).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let back = codec.decode(&jpeg).expect("decode");
        assert_eq!(back.dimensions(), (32, 24));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(JpegCodec::new(80).decode(b"not a jpeg").is_err());
    }
}
