mod animation;
mod decoders;
mod host;
mod utils;

pub use animation::{
    Animation, AnimationControl, AnimationIter, BlendOp, ColorType, DisposeOp, Frame, FrameControl, ImageHeader,
};
pub use decoders::apng::ApngDecoder;
pub use decoders::chunks::PNG_SIGNATURE;
pub use host::{LoaderHooks, NoHooks};
pub use utils::bitmap::Bitmap;
pub use utils::error::{ApngError, ApngResult};
pub use utils::info::ApngInfo;

/// Metadata for host-side format registration. No decode logic depends on
/// any of these.
pub const FORMAT_NAME: &str = "apng";
pub const FORMAT_DESCRIPTION: &str = "APNG image format";
pub const MIME_TYPES: &[&str] = &["image/apng", "video/apng"];
pub const EXTENSIONS: &[&str] = &["png", "apng"];

/// Checks whether a byte prefix looks like an APNG: the PNG signature, an
/// IHDR chunk, and an acTL chunk appearing before any IDAT. Plain PNGs
/// (no acTL) are rejected so they can fall through to a regular PNG loader.
pub fn is_apng(data: &[u8]) -> bool {
    if !data.starts_with(&PNG_SIGNATURE) {
        return false;
    }

    if data.len() < 16 || &data[12..16] != b"IHDR" {
        return false;
    }

    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= data.len() {
        let length = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let tag = &data[pos + 4..pos + 8];

        match tag {
            b"acTL" => return true,
            b"IDAT" => return false,
            _ => {}
        }

        pos += length + 12;
    }

    false
}

/// Decodes a complete APNG held in memory in one call: feeds the whole
/// buffer to a fresh session and finalizes it.
pub fn decode(data: &[u8]) -> ApngResult<Animation> {
    let mut decoder = ApngDecoder::new();
    decoder.feed(data)?;
    decoder.finish()
}
