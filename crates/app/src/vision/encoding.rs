//! JPEG and base64 conversions between [`Frame`]s and wire payloads.

use base64::{Engine as _, engine::general_purpose};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use video_io::{Frame, MediaError};

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, MediaError> {
    let image = to_rgb_image(frame)?;
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| MediaError::Encode(format!("JPEG encode failed: {err}")))?;
    Ok(buffer)
}

/// `data:image/jpeg;base64,...` URL for already encoded JPEG bytes.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(JPEG_DATA_URL_PREFIX);
    general_purpose::STANDARD.encode_string(jpeg, &mut url);
    url
}

/// Decode a base64 image payload, either bare or wrapped in a data URL.
pub fn decode_base64_image(payload: &str) -> Result<Frame, String> {
    let encoded = match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    };
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| format!("invalid base64 image data: {err}"))?;
    decode_image_bytes(&bytes)
}

/// Decode any image format the `image` crate recognises into an RGB frame.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<Frame, String> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| format!("invalid image data: {err}"))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::from_rgb(image.into_raw(), width, height).map_err(|err| err.to_string())
}

pub fn to_rgb_image(frame: &Frame) -> Result<RgbImage, MediaError> {
    RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(|| {
        MediaError::Encode(format!(
            "frame buffer does not match {}x{}",
            frame.width, frame.height
        ))
    })
}
