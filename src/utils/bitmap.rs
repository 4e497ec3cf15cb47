use crate::utils::error::ApngResult;

/// A full-color bitmap with four bytes per pixel, stored row-major as RGBA.
///
/// This is the only pixel layout the decoder produces; indexed frames are
/// expanded through the palette at reconstruction time.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Allocates a zero-filled (fully transparent) bitmap. Allocation
    /// failure is reported instead of aborting the process.
    pub fn try_new(width: u32, height: u32) -> ApngResult<Bitmap> {
        let len = width as usize * height as usize * 4;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len)?;
        pixels.resize(len, 0);

        Ok(Bitmap { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    /// Zeroes the given sub-rectangle, making it fully transparent.
    pub fn clear_region(&mut self, x: u32, y: u32, width: u32, height: u32) {
        debug_assert!(x + width <= self.width && y + height <= self.height);

        for row in y..y + height {
            let start = self.offset(x, row);
            let end = start + width as usize * 4;
            self.pixels[start..end].fill(0);
        }
    }

    /// Copies the given sub-rectangle out into a new bitmap.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> ApngResult<Bitmap> {
        debug_assert!(x + width <= self.width && y + height <= self.height);

        let mut out = Bitmap::try_new(width, height)?;
        for row in 0..height {
            let src_start = self.offset(x, y + row);
            let dst_start = out.offset(0, row);
            let len = width as usize * 4;
            out.pixels[dst_start..dst_start + len].copy_from_slice(&self.pixels[src_start..src_start + len]);
        }

        Ok(out)
    }

    /// Writes `src` into this bitmap at the given offset, replacing the
    /// destination pixels outright, alpha included.
    pub fn paste(&mut self, src: &Bitmap, x: u32, y: u32) {
        debug_assert!(x + src.width <= self.width && y + src.height <= self.height);

        for row in 0..src.height {
            let src_start = src.offset(0, row);
            let dst_start = self.offset(x, y + row);
            let len = src.width as usize * 4;
            self.pixels[dst_start..dst_start + len].copy_from_slice(&src.pixels[src_start..src_start + len]);
        }
    }

    /// Alpha-composites `src` over this bitmap at the given offset. Pixels
    /// with zero source alpha leave the destination untouched.
    pub fn blend_over(&mut self, src: &Bitmap, x: u32, y: u32) {
        debug_assert!(x + src.width <= self.width && y + src.height <= self.height);

        for row in 0..src.height {
            for col in 0..src.width {
                let s = src.offset(col, row);
                let d = self.offset(x + col, y + row);

                let src_a = src.pixels[s + 3] as f32 / 255.0;
                if src_a <= 0.0 {
                    continue;
                }

                let dst_a = self.pixels[d + 3] as f32 / 255.0;
                let out_a = src_a + dst_a * (1.0 - src_a);

                if out_a > 0.0 {
                    for i in 0..3 {
                        let sc = src.pixels[s + i] as f32;
                        let dc = self.pixels[d + i] as f32;
                        let blended = ((sc * src_a + dc * dst_a * (1.0 - src_a)) / out_a) as u8;
                        self.pixels[d + i] = blended;
                    }
                    self.pixels[d + 3] = (out_a * 255.0) as u8;
                }
            }
        }
    }
}
