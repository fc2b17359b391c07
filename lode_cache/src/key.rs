use std::fmt;

/// Content-derived identifier used for resource deduplication.
///
/// Two requests that would produce byte-identical output must map to the same
/// key, so embedded-resource keys always carry the owning document's identity
/// to avoid collisions across documents that embed resources at the same
/// local index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn external_buffer(uri: &str) -> Self {
        CacheKey(format!("buffer:{uri}"))
    }

    pub fn embedded_buffer(document: &str, buffer_index: usize) -> Self {
        CacheKey(format!("embedded-buffer:{document}#{buffer_index}"))
    }

    pub fn buffer_view(document: &str, view_index: usize) -> Self {
        CacheKey(format!("buffer-view:{document}#{view_index}"))
    }

    pub fn image(document: &str, image_index: usize) -> Self {
        CacheKey(format!("image:{document}#{image_index}"))
    }

    /// Standalone image requested directly by URI rather than through a
    /// document's image table.
    pub fn image_uri(uri: &str) -> Self {
        CacheKey(format!("image-uri:{uri}"))
    }

    pub fn draco(document: &str, view_index: usize) -> Self {
        CacheKey(format!("draco:{document}#{view_index}"))
    }

    pub fn vertex_buffer(document: &str, accessor_index: usize) -> Self {
        CacheKey(format!("vertex-buffer:{document}#{accessor_index}"))
    }

    pub fn vertex_buffer_draco(document: &str, view_index: usize, attribute: &str) -> Self {
        CacheKey(format!(
            "vertex-buffer:{document}#draco{view_index}/{attribute}"
        ))
    }

    pub fn index_buffer(document: &str, accessor_index: usize) -> Self {
        CacheKey(format!("index-buffer:{document}#{accessor_index}"))
    }

    pub fn index_buffer_draco(document: &str, view_index: usize) -> Self {
        CacheKey(format!("index-buffer:{document}#draco{view_index}"))
    }

    /// `image_index` is the variant actually selected from the document's
    /// multi-format image declarations.
    pub fn texture(document: &str, texture_index: usize, image_index: usize) -> Self {
        CacheKey(format!("texture:{document}#{texture_index}/img{image_index}"))
    }

    pub fn gltf(identity: &str) -> Self {
        CacheKey(format!("gltf:{identity}"))
    }

    pub fn feature_metadata(document: &str) -> Self {
        CacheKey(format!("feature-metadata:{document}"))
    }

    pub fn schema_uri(uri: &str) -> Self {
        CacheKey(format!("schema:{uri}"))
    }

    pub fn schema_inline(hash: u64) -> Self {
        CacheKey(format!("schema:inline#{hash:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
