//! Reference image loading and preparation for vision requests.
//!
//! Images are read from their URL or path, optionally contrast-enhanced in
//! memory, and re-encoded as base64 PNG. The source is never written to.

use crate::error::CallError;
use crate::model::ImageRef;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Fetch and decode one reference image.
pub async fn load_image(client: &reqwest::Client, image: &ImageRef) -> Result<DynamicImage, CallError> {
    let bytes = match image.as_path() {
        Some(path) => tokio::fs::read(path).await.map_err(|e| {
            CallError::MalformedRequest(format!("cannot read image {}: {}", path.display(), e))
        })?,
        None => {
            let response = client
                .get(image.locator())
                .send()
                .await
                .map_err(CallError::from)?;
            let response = super::check_status(response).await?;
            response.bytes().await.map_err(CallError::from)?.to_vec()
        }
    };

    image::load_from_memory(&bytes).map_err(|e| {
        CallError::MalformedRequest(format!("cannot decode image {}: {}", image, e))
    })
}

/// Apply a contrast adjustment; `None` or `0.0` leaves the image unchanged.
pub fn enhance(img: DynamicImage, contrast: Option<f32>) -> DynamicImage {
    match contrast {
        Some(c) if c != 0.0 => img.adjust_contrast(c),
        _ => img,
    }
}

/// Encode an image as a base64 PNG attachment.
pub fn encode_png(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded reference image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Load, enhance and encode every reference image, in order.
pub async fn prepare_all(
    client: &reqwest::Client,
    images: &[ImageRef],
    contrast: Option<f32>,
) -> Result<Vec<ImageData>, CallError> {
    let mut out = Vec::with_capacity(images.len());
    for image in images {
        let img = enhance(load_image(client, image).await?, contrast);
        let data = encode_png(&img)
            .map_err(|e| CallError::MalformedRequest(format!("cannot encode image {}: {}", image, e)))?;
        out.push(data);
    }
    Ok(out)
}
