//! Data-thread decoding of raw bytes into prepared payloads.

use mapstream_cache::ByteBuffer;

use crate::{PrepareError, PreparedPayload, ResourceKey, ResourceKind, TextureData};

/// Kind-specific decoding, run on the data thread.
pub trait ResourceDecoder: Send + Sync {
    fn decode(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        bytes: ByteBuffer,
    ) -> Result<PreparedPayload, PrepareError>;
}

/// Decodes imagery with the `image` crate and passes everything else
/// through untouched.
///
/// Texture and bound-layer payloads become RGBA8; meshes keep their bytes
/// for the uploader; meta tiles and blobs stay opaque.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl StandardDecoder {
    fn decode_image(bytes: &[u8]) -> Result<TextureData, PrepareError> {
        let image = image::load_from_memory(bytes).map_err(|err| match err {
            image::ImageError::Unsupported(unsupported) => {
                PrepareError::UnsupportedFormat(unsupported.to_string())
            }
            other => PrepareError::CorruptPayload(other.to_string()),
        })?;
        let rgba = image.to_rgba8();
        Ok(TextureData {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        })
    }
}

impl ResourceDecoder for StandardDecoder {
    fn decode(
        &self,
        kind: ResourceKind,
        _key: &ResourceKey,
        bytes: ByteBuffer,
    ) -> Result<PreparedPayload, PrepareError> {
        if bytes.is_empty() {
            return Err(PrepareError::CorruptPayload("empty payload".to_string()));
        }
        Ok(match kind {
            ResourceKind::Texture | ResourceKind::BoundLayerTile => {
                PreparedPayload::Texture(Self::decode_image(&bytes)?)
            }
            ResourceKind::Mesh => PreparedPayload::Mesh(bytes),
            ResourceKind::MetaTile | ResourceKind::Blob => PreparedPayload::Blob(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_decode_png_texture() {
        let key = ResourceKey::from("tex/0.png");
        let payload = StandardDecoder
            .decode(ResourceKind::Texture, &key, ByteBuffer::from(png_bytes(4, 2)))
            .unwrap();

        match payload {
            PreparedPayload::Texture(texture) => {
                assert_eq!((texture.width, texture.height), (4, 2));
                assert_eq!(texture.pixels.len(), 4 * 2 * 4);
                assert_eq!(&texture.pixels[..4], &[10, 20, 30, 255]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_garbage_image_fails() {
        let key = ResourceKey::from("tex/bad.jpg");
        let result = StandardDecoder.decode(
            ResourceKind::BoundLayerTile,
            &key,
            ByteBuffer::from(vec![0x42u8; 64]),
        );
        assert!(matches!(
            result,
            Err(PrepareError::UnsupportedFormat(_)) | Err(PrepareError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_truncated_png_is_corrupt() {
        let mut bytes = png_bytes(8, 8);
        bytes.truncate(bytes.len() / 2);
        let key = ResourceKey::from("tex/half.png");
        let result = StandardDecoder.decode(ResourceKind::Texture, &key, ByteBuffer::from(bytes));
        assert!(matches!(result, Err(PrepareError::CorruptPayload(_))));
    }

    #[test]
    fn test_passthrough_kinds() {
        let key = ResourceKey::from("mesh/0");
        let mesh = StandardDecoder
            .decode(ResourceKind::Mesh, &key, ByteBuffer::from(vec![1, 2, 3]))
            .unwrap();
        assert!(matches!(&mesh, PreparedPayload::Mesh(bytes) if bytes.as_slice() == [1, 2, 3]));

        let meta = StandardDecoder
            .decode(ResourceKind::MetaTile, &key, ByteBuffer::from(vec![9]))
            .unwrap();
        assert!(matches!(meta, PreparedPayload::Blob(_)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let key = ResourceKey::from("blob/empty");
        assert!(matches!(
            StandardDecoder.decode(ResourceKind::Blob, &key, ByteBuffer::new()),
            Err(PrepareError::CorruptPayload(_))
        ));
    }
}
