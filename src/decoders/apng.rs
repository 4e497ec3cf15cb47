use flate2::{Decompress, FlushDecompress, Status};

use crate::animation::{
    composite_through, Animation, AnimationControl, BlendOp, ColorType, DisposeOp, Frame, FrameControl, ImageHeader,
};
use crate::decoders::chunks::{get_chunk, ChunkReader, ChunkType};
use crate::host::LoaderHooks;
use crate::utils::bitmap::Bitmap;
use crate::utils::error::{ApngError, ApngResult};
use crate::utils::info::ApngInfo;
use crate::{log_debug, log_warn};

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Palette with alpha. PLTE fills the RGB triples with opaque alpha, tRNS
/// overwrites the first N alphas positionally.
pub(crate) struct Palette {
    entries: Vec<[u8; 4]>,
}

impl Palette {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Out-of-range indices resolve to transparent black, matching the
    /// zero-initialized lookup table of classic decoders.
    pub(crate) fn rgba(&self, index: usize) -> [u8; 4] {
        self.entries.get(index).copied().unwrap_or([0, 0, 0, 0])
    }
}

/// A frame whose control record has been parsed but whose pixel data is
/// still arriving. At most one of these exists per session.
struct PendingFrame {
    control: FrameControl,
    bitmap: Bitmap,
    scratch: Vec<u8>,
    received: usize,
    inflate: Decompress,
}

impl PendingFrame {
    fn new(control: FrameControl, color_type: ColorType) -> ApngResult<Self> {
        let width = control.width as usize;
        let height = control.height as usize;

        // One filter-type byte per scanline, then the scanline payload.
        let expected = match color_type {
            ColorType::Indexed => height * (width + 1),
            ColorType::Rgba => height * (width * 4 + 1),
        };

        let bitmap = Bitmap::try_new(control.width, control.height)?;

        let mut scratch = Vec::new();
        scratch.try_reserve_exact(expected)?;
        scratch.resize(expected, 0);

        Ok(Self {
            control,
            bitmap,
            scratch,
            received: 0,
            inflate: Decompress::new(true),
        })
    }

    fn is_complete(&self) -> bool {
        self.received == self.scratch.len()
    }

    /// Feeds one chunk's worth of compressed bytes into the frame's zlib
    /// stream. The stream resumes across chunks; any trailing bytes past
    /// the expected decompressed size (the zlib trailer) are discarded.
    fn decompress(&mut self, mut data: &[u8]) -> ApngResult<()> {
        while !data.is_empty() && self.received < self.scratch.len() {
            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();

            let status = self
                .inflate
                .decompress(data, &mut self.scratch[self.received..], FlushDecompress::None)
                .map_err(|e| ApngError::CorruptImage(format!("error while decompressing frame data: {}", e)))?;

            let consumed = (self.inflate.total_in() - in_before) as usize;
            let produced = (self.inflate.total_out() - out_before) as usize;
            data = &data[consumed..];
            self.received += produced;

            match status {
                Status::StreamEnd => break,
                Status::BufError => {
                    return Err(ApngError::InsufficientMemory(
                        "output buffer too small while decompressing frame data".to_string(),
                    ));
                }
                Status::Ok => {
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Streaming APNG decode session.
///
/// The host feeds raw bytes as they arrive with `feed`; chunks are parsed
/// as soon as they are complete, frames are composited eagerly, and
/// `finish` hands over the decoded `Animation` once the byte source ends.
/// Errors are terminal: no partial animation is ever returned.
pub struct ApngDecoder {
    reader: ChunkReader,
    hooks: Option<Box<dyn LoaderHooks>>,
    header: Option<ImageHeader>,
    control: Option<AnimationControl>,
    palette: Palette,
    frames: Vec<Frame>,
    pending: Option<PendingFrame>,
}

impl ApngDecoder {
    pub fn new() -> Self {
        Self {
            reader: ChunkReader::new(),
            hooks: None,
            header: None,
            control: None,
            palette: Palette::new(),
            frames: Vec::new(),
            pending: None,
        }
    }

    /// Like `new`, but with host callbacks for size negotiation and
    /// first-frame display.
    pub fn with_hooks(hooks: Box<dyn LoaderHooks>) -> Self {
        let mut decoder = Self::new();
        decoder.hooks = Some(hooks);
        decoder
    }

    pub fn get_info(&self) -> ApngInfo {
        let mut frame_controls: Vec<FrameControl> = self.frames.iter().map(|f| f.control.clone()).collect();
        if let Some(pending) = &self.pending {
            frame_controls.push(pending.control.clone());
        }

        ApngInfo {
            header: self.header.clone(),
            animation_control: self.control.clone(),
            palette_size: self.palette.len(),
            decoded_frames: self.frames.len(),
            frame_controls,
        }
    }

    /// Consumes the next fragment of the byte stream, however small, and
    /// processes every chunk that is now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> ApngResult<()> {
        self.reader.extend(bytes)?;

        while let Some(chunk) = self.reader.next_chunk()? {
            match get_chunk(&chunk.tag) {
                Some(ChunkType::IHDR) => self.read_ihdr(&chunk.data)?,
                Some(ChunkType::ACTL) => self.read_actl(&chunk.data)?,
                Some(ChunkType::PLTE) => self.read_plte(&chunk.data)?,
                Some(ChunkType::TRNS) => self.read_trns(&chunk.data)?,
                Some(ChunkType::FCTL) => self.read_fctl(&chunk.data)?,
                Some(ChunkType::IDAT) => self.read_idat(&chunk.data)?,
                Some(ChunkType::FDAT) => self.read_fdat(&chunk.data)?,
                Some(ChunkType::IEND) => {}
                None => {
                    log_debug!("Skipping chunk {:?}", String::from_utf8_lossy(&chunk.tag));
                }
            }
        }

        Ok(())
    }

    /// Finalizes the session once the byte source has ended. Succeeds only
    /// when at least one frame decoded and the frame count matches the
    /// count acTL declared.
    pub fn finish(self) -> ApngResult<Animation> {
        let header = self
            .header
            .ok_or_else(|| ApngError::CorruptImage("stream ended before IHDR".to_string()))?;
        let control = self
            .control
            .ok_or_else(|| ApngError::CorruptImage("stream ended before acTL".to_string()))?;

        if self.pending.is_some()
            || self.frames.is_empty()
            || (self.frames.len() as u32) < control.num_frames
        {
            return Err(ApngError::CorruptImage(
                "APNG image was truncated or incomplete".to_string(),
            ));
        }

        Ok(Animation::new(header, control, self.frames))
    }

    fn require_header(&self) -> ApngResult<&ImageHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| ApngError::CorruptImage("chunk arrived before IHDR".to_string()))
    }

    fn read_ihdr(&mut self, data: &[u8]) -> ApngResult<()> {
        if self.header.is_some() {
            return Err(ApngError::CorruptImage("duplicate IHDR chunk".to_string()));
        }

        if data.len() != 13 {
            return Err(ApngError::CorruptImage(format!("IHDR length {}, expected 13", data.len())));
        }

        let mut width = be_u32(&data[0..4]);
        let mut height = be_u32(&data[4..8]);
        let bit_depth = data[8];
        let color_type = data[9];
        let compression_method = data[10];
        let filter_method = data[11];
        let interlace_method = data[12];

        if width == 0 || height == 0 {
            return Err(ApngError::CorruptImage(format!("zero image dimensions {}x{}", width, height)));
        }

        if bit_depth != 8 {
            return Err(ApngError::UnsupportedFormat(format!("bit depth {}", bit_depth)));
        }

        let color_type = match color_type {
            3 => ColorType::Indexed,
            6 => ColorType::Rgba,
            n => return Err(ApngError::UnsupportedFormat(format!("color type {}", n))),
        };

        if compression_method != 0 {
            return Err(ApngError::UnsupportedFormat(format!(
                "compression method {}",
                compression_method
            )));
        }

        if filter_method != 0 {
            return Err(ApngError::UnsupportedFormat(format!("filter method {}", filter_method)));
        }

        if interlace_method != 0 {
            return Err(ApngError::UnsupportedFormat(format!(
                "interlace method {}",
                interlace_method
            )));
        }

        // The host may rewrite the dimensions, e.g. to request a downscale;
        // every later allocation honors the rewritten values.
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.size_ready(&mut width, &mut height);
        }

        self.header = Some(ImageHeader {
            width,
            height,
            bit_depth,
            color_type,
            compression_method,
            filter_method,
            interlace_method,
        });

        Ok(())
    }

    fn read_actl(&mut self, data: &[u8]) -> ApngResult<()> {
        self.require_header()?;

        if self.control.is_some() {
            return Err(ApngError::CorruptImage("duplicate acTL chunk".to_string()));
        }

        if self.pending.is_some() || !self.frames.is_empty() {
            return Err(ApngError::CorruptImage("acTL chunk after frame data".to_string()));
        }

        if data.len() != 8 {
            return Err(ApngError::CorruptImage(format!("acTL length {}, expected 8", data.len())));
        }

        self.control = Some(AnimationControl {
            num_frames: be_u32(&data[0..4]),
            num_plays: be_u32(&data[4..8]),
        });

        Ok(())
    }

    fn read_plte(&mut self, data: &[u8]) -> ApngResult<()> {
        let header = self.require_header()?;

        if header.color_type != ColorType::Indexed {
            return Err(ApngError::CorruptImage(
                "PLTE chunk in a non-indexed image".to_string(),
            ));
        }

        if !self.palette.is_empty() {
            return Err(ApngError::CorruptImage("duplicate PLTE chunk".to_string()));
        }

        if data.len() % 3 != 0 {
            return Err(ApngError::CorruptImage(
                "PLTE chunk length is not a multiple of 3".to_string(),
            ));
        }

        let entries = data.len() / 3;
        if !(2..=256).contains(&entries) {
            return Err(ApngError::CorruptImage(format!("PLTE with {} entries", entries)));
        }

        for rgb in data.chunks_exact(3) {
            self.palette.entries.push([rgb[0], rgb[1], rgb[2], 0xff]);
        }

        Ok(())
    }

    fn read_trns(&mut self, data: &[u8]) -> ApngResult<()> {
        let header = self.require_header()?;

        match header.color_type {
            ColorType::Indexed => {
                if self.palette.is_empty() {
                    return Err(ApngError::CorruptImage("tRNS chunk before PLTE".to_string()));
                }

                if data.len() > self.palette.len() {
                    return Err(ApngError::CorruptImage(format!(
                        "tRNS with {} entries for a {}-entry palette",
                        data.len(),
                        self.palette.len()
                    )));
                }

                for (i, &alpha) in data.iter().enumerate() {
                    self.palette.entries[i][3] = alpha;
                }
            }
            ColorType::Rgba => {
                // A color key makes no sense when every pixel already
                // carries alpha.
                log_warn!("Ignoring tRNS chunk for truecolor with alpha");
            }
        }

        Ok(())
    }

    fn read_fctl(&mut self, data: &[u8]) -> ApngResult<()> {
        let (canvas_width, canvas_height, color_type) = {
            let header = self.require_header()?;
            (header.width, header.height, header.color_type)
        };

        let control = self
            .control
            .as_ref()
            .ok_or_else(|| ApngError::CorruptImage("fcTL chunk before acTL".to_string()))?;

        if self.pending.is_some() {
            return Err(ApngError::CorruptImage(
                "fcTL chunk while a frame is still in progress".to_string(),
            ));
        }

        if self.frames.len() as u32 >= control.num_frames {
            return Err(ApngError::CorruptImage("more fcTL chunks than acTL declared".to_string()));
        }

        if data.len() != 26 {
            return Err(ApngError::CorruptImage(format!("fcTL length {}, expected 26", data.len())));
        }

        let dispose_op = DisposeOp::from_u8(data[24])
            .ok_or_else(|| ApngError::CorruptImage(format!("unknown dispose op {}", data[24])))?;
        let blend_op = BlendOp::from_u8(data[25])
            .ok_or_else(|| ApngError::CorruptImage(format!("unknown blend op {}", data[25])))?;

        let fctl = FrameControl {
            sequence_number: be_u32(&data[0..4]),
            width: be_u32(&data[4..8]),
            height: be_u32(&data[8..12]),
            x_offset: be_u32(&data[12..16]),
            y_offset: be_u32(&data[16..20]),
            delay_num: be_u16(&data[20..22]),
            delay_den: be_u16(&data[22..24]),
            dispose_op,
            blend_op,
        };

        if fctl.width == 0 || fctl.height == 0 {
            return Err(ApngError::CorruptImage("empty frame region".to_string()));
        }

        // Reject out-of-canvas regions here so the compositor can rely on
        // them as an invariant.
        if fctl.x_offset as u64 + fctl.width as u64 > canvas_width as u64
            || fctl.y_offset as u64 + fctl.height as u64 > canvas_height as u64
        {
            return Err(ApngError::CorruptImage(format!(
                "frame region {}x{}+{}+{} outside the {}x{} canvas",
                fctl.width, fctl.height, fctl.x_offset, fctl.y_offset, canvas_width, canvas_height
            )));
        }

        self.pending = Some(PendingFrame::new(fctl, color_type)?);

        Ok(())
    }

    fn read_idat(&mut self, data: &[u8]) -> ApngResult<()> {
        if !self.frames.is_empty() {
            return Err(ApngError::CorruptImage("IDAT chunk after the first frame".to_string()));
        }

        self.read_frame_data(data)
    }

    fn read_fdat(&mut self, data: &[u8]) -> ApngResult<()> {
        if self.frames.is_empty() {
            return Err(ApngError::CorruptImage("fdAT chunk before the first frame".to_string()));
        }

        if data.len() < 4 {
            return Err(ApngError::CorruptImage(format!("fdAT length {}, expected at least 4", data.len())));
        }

        // The sequence-number prefix is not part of the pixel data.
        let sequence_number = be_u32(&data[0..4]);
        log_debug!("fdAT sequence number {}", sequence_number);

        self.read_frame_data(&data[4..])
    }

    fn read_frame_data(&mut self, data: &[u8]) -> ApngResult<()> {
        let color_type = self.require_header()?.color_type;

        if color_type == ColorType::Indexed && self.palette.is_empty() {
            return Err(ApngError::CorruptImage(
                "frame data for an indexed image without a palette".to_string(),
            ));
        }

        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| ApngError::CorruptImage("frame data without a preceding fcTL".to_string()))?;

        pending.decompress(data)?;

        if pending.is_complete() {
            self.complete_frame()?;
        }

        Ok(())
    }

    /// All of a frame's pixel data has decompressed: reconstruct the RGBA
    /// bitmap, append the frame, composite it eagerly and announce the
    /// first frame to the host.
    fn complete_frame(&mut self) -> ApngResult<()> {
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let (canvas_width, canvas_height, color_type) = {
            let header = self.require_header()?;
            (header.width, header.height, header.color_type)
        };

        match color_type {
            ColorType::Indexed => expand_indexed(&pending.scratch, &self.palette, &mut pending.bitmap)?,
            ColorType::Rgba => unfilter_rgba(&pending.scratch, &mut pending.bitmap)?,
        }

        self.frames.push(Frame::new(pending.control, pending.bitmap));

        let index = self.frames.len() - 1;
        composite_through(canvas_width, canvas_height, &mut self.frames, index)?;

        if index == 0 {
            if let Some(hooks) = self.hooks.as_mut() {
                hooks.frame_ready(self.frames[0].bitmap());
            }
        }

        Ok(())
    }
}

impl Default for ApngDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns decompressed indexed scanlines into RGBA pixels. Indexed frames
/// must not be filtered, so every scanline's filter byte has to be zero.
fn expand_indexed(scratch: &[u8], palette: &Palette, bitmap: &mut Bitmap) -> ApngResult<()> {
    let width = bitmap.width() as usize;
    let height = bitmap.height() as usize;
    let line = width + 1;
    let pixels = bitmap.pixels_mut();

    for y in 0..height {
        let filter_type = scratch[y * line];
        if filter_type != 0 {
            return Err(ApngError::CorruptImage(format!(
                "filter type {} on an indexed scanline",
                filter_type
            )));
        }

        for x in 0..width {
            let rgba = palette.rgba(scratch[y * line + 1 + x] as usize);
            pixels[(y * width + x) * 4..(y * width + x) * 4 + 4].copy_from_slice(&rgba);
        }
    }

    Ok(())
}

/// Reconstructs truecolor+alpha pixels from filtered scanlines. Each row
/// starts with a filter-type byte; neighbors outside the image count as
/// zero. The pixel byte step is 4 since bit depth is fixed at 8.
fn unfilter_rgba(scratch: &[u8], bitmap: &mut Bitmap) -> ApngResult<()> {
    const BPP: usize = 4;

    let width = bitmap.width() as usize;
    let height = bitmap.height() as usize;
    let stride = width * BPP;
    let line = stride + 1;
    let pixels = bitmap.pixels_mut();

    for y in 0..height {
        let filter_type = scratch[y * line];
        let row = y * stride;

        pixels[row..row + stride].copy_from_slice(&scratch[y * line + 1..y * line + 1 + stride]);

        match filter_type {
            0 => {}
            1 => {
                for x in BPP..stride {
                    let a = pixels[row + x - BPP];
                    pixels[row + x] = pixels[row + x].wrapping_add(a);
                }
            }
            2 => {
                if y > 0 {
                    for x in 0..stride {
                        let b = pixels[row - stride + x];
                        pixels[row + x] = pixels[row + x].wrapping_add(b);
                    }
                }
            }
            3 => {
                for x in 0..stride {
                    let a = if x >= BPP { pixels[row + x - BPP] as u16 } else { 0 };
                    let b = if y > 0 { pixels[row - stride + x] as u16 } else { 0 };
                    pixels[row + x] = pixels[row + x].wrapping_add(((a + b) >> 1) as u8);
                }
            }
            4 => {
                for x in 0..stride {
                    let a = if x >= BPP { pixels[row + x - BPP] } else { 0 };
                    let b = if y > 0 { pixels[row - stride + x] } else { 0 };
                    let c = if y > 0 && x >= BPP { pixels[row - stride + x - BPP] } else { 0 };
                    pixels[row + x] = pixels[row + x].wrapping_add(paeth_predictor(a, b, c));
                }
            }
            n => {
                return Err(ApngError::CorruptImage(format!("invalid scanline filter type {}", n)));
            }
        }
    }

    Ok(())
}

fn paeth_predictor(a: u8, b: u8, c: u8) -> u8 {
    // a = left, b = above, c = upper left
    let a = a as i16;
    let b = b as i16;
    let c = c as i16;

    let p = a + b - c; // Initial estimate
    let pa = (p - a).abs(); // Distance to a
    let pb = (p - b).abs(); // Distance to b
    let pc = (p - c).abs(); // Distance to c

    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}
