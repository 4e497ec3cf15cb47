use serde::Serialize;

use crate::animation::{AnimationControl, FrameControl, ImageHeader};

/// Snapshot of everything the decoder knows about the stream so far, for
/// host-side introspection or serialization.
#[derive(Debug, Serialize)]
pub struct ApngInfo {
    pub header: Option<ImageHeader>,
    pub animation_control: Option<AnimationControl>,
    pub palette_size: usize,
    pub decoded_frames: usize,
    pub frame_controls: Vec<FrameControl>,
}
