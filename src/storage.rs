//! Object storage for screenshots and other binary artifacts.
//!
//! The browser tool receives screenshots as base64 from the automation API
//! and must persist a URL, not megabytes of inline data.  Deployments plug
//! in a real object store; [`InlineImageStore`] keeps everything in-process
//! by returning a `data:` URL.

use async_trait::async_trait;

/// Upload base64-encoded images, returning a dereferenceable URL.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload_base64(&self, base64_data: &str, mime_type: &str) -> Result<String, String>;
}

/// Fallback store that encodes the image as a `data:` URL.
pub struct InlineImageStore;

#[async_trait]
impl ImageStore for InlineImageStore {
    async fn upload_base64(&self, base64_data: &str, mime_type: &str) -> Result<String, String> {
        Ok(format!("data:{mime_type};base64,{base64_data}"))
    }
}
