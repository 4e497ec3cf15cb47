use std::time::Instant;

use serde::Serialize;

use crate::log_warn;
use crate::utils::bitmap::Bitmap;
use crate::utils::error::{ApngError, ApngResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ColorType {
    Indexed = 3,
    Rgba = 6,
}

/// Contents of the IHDR chunk. Set exactly once per stream.
#[derive(Debug, Clone, Serialize)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: ColorType,
    pub compression_method: u8,
    pub filter_method: u8,
    pub interlace_method: u8,
}

/// Contents of the acTL chunk: how many frames the stream declares and how
/// many times the host should loop them (0 means forever).
#[derive(Debug, Clone, Serialize)]
pub struct AnimationControl {
    pub num_frames: u32,
    pub num_plays: u32,
}

/// What happens to a frame's region of the canvas after that frame's
/// display, before the next frame is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DisposeOp {
    None = 0,
    Background = 1,
    Previous = 2,
}

impl DisposeOp {
    pub fn from_u8(value: u8) -> Option<DisposeOp> {
        match value {
            0 => Some(DisposeOp::None),
            1 => Some(DisposeOp::Background),
            2 => Some(DisposeOp::Previous),
            _ => None,
        }
    }
}

/// How a frame's decoded pixels combine with the canvas in its region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BlendOp {
    Source = 0,
    Over = 1,
}

impl BlendOp {
    pub fn from_u8(value: u8) -> Option<BlendOp> {
        match value {
            0 => Some(BlendOp::Source),
            1 => Some(BlendOp::Over),
            _ => None,
        }
    }
}

/// Contents of one fcTL chunk. The region described by offset and size is
/// validated against the canvas at parse time.
#[derive(Debug, Clone, Serialize)]
pub struct FrameControl {
    pub sequence_number: u32,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub delay_num: u16,
    pub delay_den: u16,
    pub dispose_op: DisposeOp,
    pub blend_op: BlendOp,
}

impl FrameControl {
    /// Display duration in microseconds. A zero denominator means 100ths
    /// of a second.
    pub fn delay_us(&self) -> u64 {
        let den = if self.delay_den == 0 { 100 } else { self.delay_den as u64 };
        self.delay_num as u64 * 1_000_000 / den
    }

    /// Display duration in whole milliseconds.
    pub fn delay_ms(&self) -> u32 {
        (self.delay_us() / 1000) as u32
    }
}

/// One decoded frame: its control record, the raw region-sized bitmap, the
/// lazily-built full-canvas composited bitmap, and the revert snapshot used
/// to implement `Previous` disposal.
#[derive(Debug)]
pub struct Frame {
    pub control: FrameControl,
    pub(crate) bitmap: Bitmap,
    pub(crate) composited: Option<Bitmap>,
    pub(crate) revert: Option<Bitmap>,
}

impl Frame {
    pub(crate) fn new(control: FrameControl, bitmap: Bitmap) -> Frame {
        Frame {
            control,
            bitmap,
            composited: None,
            revert: None,
        }
    }

    /// The frame's own decoded pixels, sized to its region.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// The full-canvas bitmap for display at this frame, if it is currently
    /// materialized. Compositing a later frame takes ownership of it, so
    /// only the most recently composited frame usually holds one.
    pub fn composited(&self) -> Option<&Bitmap> {
        self.composited.as_ref()
    }
}

/// A fully decoded animation: header, animation control and the ordered
/// frame store. Produced by `ApngDecoder::finish`, which guarantees at
/// least one frame.
#[derive(Debug)]
pub struct Animation {
    header: ImageHeader,
    control: AnimationControl,
    frames: Vec<Frame>,
}

impl Animation {
    pub(crate) fn new(header: ImageHeader, control: AnimationControl, frames: Vec<Frame>) -> Animation {
        Animation {
            header,
            control,
            frames,
        }
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn animation_control(&self) -> &AnimationControl {
        &self.control
    }

    pub fn size(&self) -> (u32, u32) {
        (self.header.width, self.header.height)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_single_frame(&self) -> bool {
        self.control.num_frames == 1
    }

    /// The raw bitmap of the first frame, for hosts that want a still image.
    pub fn first_frame_bitmap(&self) -> &Bitmap {
        &self.frames[0].bitmap
    }

    /// Guarantees `frames[index]` has a composited bitmap. No-op when it
    /// already does.
    pub fn ensure_composited(&mut self, index: usize) -> ApngResult<()> {
        composite_through(self.header.width, self.header.height, &mut self.frames, index)
    }

    /// Opens a playback cursor positioned at the first frame.
    pub fn iter(&mut self, start_time: Instant) -> AnimationIter<'_> {
        let current = if self.frames.is_empty() { None } else { Some(0) };

        AnimationIter {
            anim: self,
            current,
            start_time,
        }
    }
}

/// Composites every frame up to and including `index` that does not already
/// hold a composited bitmap.
///
/// The canvas is handed forward frame to frame as a single-owner move: the
/// previous frame's composited bitmap is taken, the previous frame's
/// disposal is applied to it, and the result becomes the current frame's
/// composited bitmap once the current frame is drawn on top.
pub(crate) fn composite_through(
    canvas_width: u32,
    canvas_height: u32,
    frames: &mut [Frame],
    index: usize,
) -> ApngResult<()> {
    if frames[index].composited.is_some() {
        return Ok(());
    }

    // Rewind to the nearest frame that still holds a composited canvas.
    let mut start = index;
    while start > 0 && frames[start].composited.is_none() {
        start -= 1;
    }

    for i in start..=index {
        if frames[i].composited.is_some() {
            continue;
        }

        let mut canvas = if i == 0 {
            // The first frame may be smaller than the whole canvas; the
            // area outside it stays fully transparent.
            if frames[0].control.dispose_op == DisposeOp::Previous {
                log_warn!("First frame has Previous dispose op, treating it as None");
            }

            Bitmap::try_new(canvas_width, canvas_height)?
        } else {
            let (before, _) = frames.split_at_mut(i);
            let prev = &mut before[i - 1];

            let mut canvas = prev.composited.take().ok_or_else(|| {
                ApngError::CorruptImage("previous frame lost its composited bitmap".to_string())
            })?;

            let pc = &prev.control;
            debug_assert!(pc.x_offset + pc.width <= canvas_width);
            debug_assert!(pc.y_offset + pc.height <= canvas_height);

            match pc.dispose_op {
                DisposeOp::None => {}
                DisposeOp::Background => {
                    canvas.clear_region(pc.x_offset, pc.y_offset, pc.width, pc.height);
                }
                DisposeOp::Previous => {
                    if let Some(revert) = &prev.revert {
                        canvas.paste(revert, pc.x_offset, pc.y_offset);
                    }
                }
            }

            canvas
        };

        let frame = &mut frames[i];
        let fc = &frame.control;
        debug_assert!(fc.x_offset + fc.width <= canvas_width);
        debug_assert!(fc.y_offset + fc.height <= canvas_height);

        // Snapshot the canvas under this frame's region before drawing, so
        // Previous disposal can restore the pre-draw content later.
        if i > 0 && fc.dispose_op == DisposeOp::Previous && frame.revert.is_none() {
            frame.revert = Some(canvas.crop(fc.x_offset, fc.y_offset, fc.width, fc.height)?);
        }

        match fc.blend_op {
            BlendOp::Source => canvas.paste(&frame.bitmap, fc.x_offset, fc.y_offset),
            BlendOp::Over => canvas.blend_over(&frame.bitmap, fc.x_offset, fc.y_offset),
        }

        frame.composited = Some(canvas);
    }

    Ok(())
}

/// A pull-based playback cursor over a decoded animation.
///
/// The cursor tracks wall-clock time: `advance` moves forward at most one
/// frame per call once the current frame's delay has elapsed, wrapping back
/// to the first frame at the end of the list. The document's declared play
/// count is left to the host.
pub struct AnimationIter<'a> {
    anim: &'a mut Animation,
    current: Option<usize>,
    start_time: Instant,
}

impl<'a> AnimationIter<'a> {
    fn current_index(&self) -> usize {
        self.current.unwrap_or(self.anim.frames.len() - 1)
    }

    /// Display duration of the current frame in whole milliseconds.
    pub fn delay_ms(&self) -> u32 {
        self.anim.frames[self.current_index()].control.delay_ms()
    }

    /// The composited bitmap to display right now, compositing lazily if
    /// needed. Past the end of the list this falls back to the last frame.
    pub fn frame_bitmap(&mut self) -> ApngResult<&Bitmap> {
        let index = self.current_index();

        self.anim.ensure_composited(index)?;

        self.anim.frames[index]
            .composited
            .as_ref()
            .ok_or_else(|| ApngError::CorruptImage("frame has no composited bitmap".to_string()))
    }

    /// True when there is no frame after the current one. Streaming hosts
    /// use this to distinguish "still loading" from "final frame".
    pub fn is_final_frame(&self) -> bool {
        match self.current {
            None => true,
            Some(index) => index + 1 >= self.anim.frames.len(),
        }
    }

    /// Re-evaluates the current frame for the given time. Returns true when
    /// the cursor moved to a different frame.
    pub fn advance(&mut self, now: Instant) -> bool {
        let elapsed_us = match now.checked_duration_since(self.start_time) {
            Some(elapsed) => elapsed.as_micros() as u64,
            None => {
                // Clock went backward, restart the current frame's delay.
                self.start_time = now;
                0
            }
        };

        let index = self.current_index();
        let delay_us = self.anim.frames[index].control.delay_us();

        if elapsed_us >= delay_us {
            self.start_time = now;

            let mut next = index + 1;
            if next >= self.anim.frames.len() {
                next = 0;
            }
            self.current = Some(next);

            next != index
        } else {
            false
        }
    }
}
