//! Resource kinds and their prepared payloads.

use std::any::Any;
use std::fmt;

use mapstream_cache::ByteBuffer;
use serde::{Deserialize, Serialize};

/// What a resource is. Fixed by the first request for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Tile hierarchy metadata
    MetaTile,
    Mesh,
    Texture,
    /// Imagery draped from a bound layer
    BoundLayerTile,
    /// Anything else, kept as opaque bytes
    Blob,
}

impl ResourceKind {
    /// Whether the resource only becomes usable after a GPU upload.
    pub fn needs_gpu(self) -> bool {
        matches!(
            self,
            ResourceKind::Mesh | ResourceKind::Texture | ResourceKind::BoundLayerTile
        )
    }

    pub fn is_image(self) -> bool {
        matches!(self, ResourceKind::Texture | ResourceKind::BoundLayerTile)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::MetaTile => "meta_tile",
            ResourceKind::Mesh => "mesh",
            ResourceKind::Texture => "texture",
            ResourceKind::BoundLayerTile => "bound_layer_tile",
            ResourceKind::Blob => "blob",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded RGBA8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn memory_size(&self) -> usize {
        self.pixels.capacity()
    }
}

/// Upload-ready representation produced on the data thread.
pub enum PreparedPayload {
    Texture(TextureData),
    /// Mesh data in the renderer's vertex layout
    Mesh(ByteBuffer),
    Blob(ByteBuffer),
    /// Structured data from a custom decoder, e.g. a parsed meta tile
    Custom {
        value: Box<dyn Any + Send + Sync>,
        memory: usize,
    },
}

impl PreparedPayload {
    pub fn custom<T: Any + Send + Sync>(value: T, memory: usize) -> Self {
        PreparedPayload::Custom {
            value: Box::new(value),
            memory,
        }
    }

    /// Bytes of RAM held by the payload.
    pub fn footprint(&self) -> usize {
        match self {
            PreparedPayload::Texture(texture) => texture.memory_size(),
            PreparedPayload::Mesh(bytes) | PreparedPayload::Blob(bytes) => bytes.memory_size(),
            PreparedPayload::Custom { memory, .. } => *memory,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PreparedPayload::Mesh(bytes) | PreparedPayload::Blob(bytes) => Some(bytes.as_slice()),
            PreparedPayload::Texture(texture) => Some(&texture.pixels),
            PreparedPayload::Custom { .. } => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            PreparedPayload::Custom { value, .. } => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for PreparedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreparedPayload::Texture(texture) => f
                .debug_struct("Texture")
                .field("width", &texture.width)
                .field("height", &texture.height)
                .finish(),
            PreparedPayload::Mesh(bytes) => f.debug_tuple("Mesh").field(&bytes.len()).finish(),
            PreparedPayload::Blob(bytes) => f.debug_tuple("Blob").field(&bytes.len()).finish(),
            PreparedPayload::Custom { memory, .. } => {
                f.debug_struct("Custom").field("memory", memory).finish()
            }
        }
    }
}
