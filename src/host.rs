use crate::utils::bitmap::Bitmap;

/// Callbacks the decoder pushes into while a stream is being fed.
///
/// Implemented by the host image-loading framework; every method has an
/// empty default so hosts only override what they care about.
pub trait LoaderHooks {
    /// Invoked once, right after IHDR has been parsed. The host may rewrite
    /// the dimensions (for example to request a downscale); later bitmap
    /// allocations honor the rewritten values.
    fn size_ready(&mut self, width: &mut u32, height: &mut u32) {
        let _ = (width, height);
    }

    /// Invoked once when the first frame has fully decoded, so the host can
    /// display something before the rest of the stream arrives.
    fn frame_ready(&mut self, bitmap: &Bitmap) {
        let _ = bitmap;
    }

    /// Per-region update notification. Part of the loader protocol but not
    /// emitted by this decoder, which reports whole frames only.
    fn area_updated(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let _ = (x, y, width, height);
    }
}

/// Hook implementation that ignores every notification.
pub struct NoHooks;

impl LoaderHooks for NoHooks {}
