#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use apng_stream::{
        decode, is_apng, ApngDecoder, ApngError, Bitmap, LoaderHooks, PNG_SIGNATURE,
    };

    fn crc32(tag: &[u8], data: &[u8]) -> u32 {
        let mut c = 0xffffffffu32;
        for &b in tag.iter().chain(data.iter()) {
            c ^= b as u32;
            for _ in 0..8 {
                c = if c & 1 == 1 { 0xedb88320 ^ (c >> 1) } else { c >> 1 };
            }
        }
        c ^ 0xffffffff
    }

    fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc32(tag, payload).to_be_bytes());
        out
    }

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn ihdr(width: u32, height: u32, bit_depth: u8, color_type: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&[bit_depth, color_type, 0, 0, 0]);
        out
    }

    fn actl(num_frames: u32, num_plays: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&num_frames.to_be_bytes());
        out.extend_from_slice(&num_plays.to_be_bytes());
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn fctl(
        seq: u32,
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        delay_num: u16,
        delay_den: u16,
        dispose: u8,
        blend: u8,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&x.to_be_bytes());
        out.extend_from_slice(&y.to_be_bytes());
        out.extend_from_slice(&delay_num.to_be_bytes());
        out.extend_from_slice(&delay_den.to_be_bytes());
        out.push(dispose);
        out.push(blend);
        out
    }

    fn fdat(seq: u32, compressed: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(compressed);
        out
    }

    /// Prefixes every row of raw RGBA pixel data with filter type 0.
    fn filter0_scanlines(pixels: &[u8], width: u32) -> Vec<u8> {
        let stride = width as usize * 4;
        let mut out = Vec::new();
        for row in pixels.chunks(stride) {
            out.push(0);
            out.extend_from_slice(row);
        }
        out
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        rgba.iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect()
    }

    struct TestFrame {
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        delay_num: u16,
        delay_den: u16,
        dispose: u8,
        blend: u8,
        pixels: Vec<u8>,
    }

    fn solid_frame(width: u32, height: u32, x: u32, y: u32, rgba: [u8; 4]) -> TestFrame {
        TestFrame {
            width,
            height,
            x,
            y,
            delay_num: 1,
            delay_den: 0,
            dispose: 0,
            blend: 0,
            pixels: solid(width, height, rgba),
        }
    }

    fn build_rgba_apng(canvas_width: u32, canvas_height: u32, frames: &[TestFrame]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PNG_SIGNATURE);
        out.extend_from_slice(&chunk(b"IHDR", &ihdr(canvas_width, canvas_height, 8, 6)));
        out.extend_from_slice(&chunk(b"acTL", &actl(frames.len() as u32, 0)));

        let mut seq = 0u32;
        for (i, frame) in frames.iter().enumerate() {
            out.extend_from_slice(&chunk(
                b"fcTL",
                &fctl(
                    seq,
                    frame.width,
                    frame.height,
                    frame.x,
                    frame.y,
                    frame.delay_num,
                    frame.delay_den,
                    frame.dispose,
                    frame.blend,
                ),
            ));
            seq += 1;

            let compressed = compress(&filter0_scanlines(&frame.pixels, frame.width));
            if i == 0 {
                out.extend_from_slice(&chunk(b"IDAT", &compressed));
            } else {
                out.extend_from_slice(&chunk(b"fdAT", &fdat(seq, &compressed)));
                seq += 1;
            }
        }

        out.extend_from_slice(&chunk(b"IEND", &[]));
        out
    }

    fn px(bitmap: &Bitmap, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * bitmap.width() as usize + x as usize) * 4;
        let p = &bitmap.pixels()[offset..offset + 4];
        [p[0], p[1], p[2], p[3]]
    }

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];
    const CLEAR: [u8; 4] = [0, 0, 0, 0];

    #[test]
    fn test_single_frame_document() {
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED)]);
        let mut anim = decode(&data).unwrap();

        assert!(anim.is_single_frame());
        assert_eq!(anim.frame_count(), 1);
        assert_eq!(anim.size(), (2, 2));

        anim.ensure_composited(0).unwrap();
        let frame = &anim.frames()[0];

        // A lone full-canvas frame needs no disposal or blending, so the
        // composited canvas equals the raw decoded bitmap.
        assert_eq!(frame.composited().unwrap().pixels(), frame.bitmap().pixels());
    }

    #[test]
    fn test_feed_chunking_independence() {
        let mut second = solid_frame(1, 2, 1, 0, GREEN);
        second.blend = 1;
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second]);

        let mut whole = decode(&data).unwrap();

        let mut decoder = ApngDecoder::new();
        for byte in &data {
            decoder.feed(std::slice::from_ref(byte)).unwrap();
        }
        let mut trickled = decoder.finish().unwrap();

        assert_eq!(whole.frame_count(), trickled.frame_count());

        for i in (0..whole.frame_count()).rev() {
            whole.ensure_composited(i).unwrap();
            trickled.ensure_composited(i).unwrap();
            assert_eq!(
                whole.frames()[i].composited().unwrap().pixels(),
                trickled.frames()[i].composited().unwrap().pixels(),
                "composited frame {} differs between feed granularities",
                i
            );
        }
    }

    #[test]
    fn test_background_disposal_clears_only_previous_region() {
        let mut second = solid_frame(1, 2, 1, 0, GREEN);
        second.dispose = 1; // Background
        let third = solid_frame(1, 1, 0, 0, BLUE);

        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second, third]);
        let mut anim = decode(&data).unwrap();

        anim.ensure_composited(2).unwrap();
        let canvas = anim.frames()[2].composited().unwrap();

        assert_eq!(px(canvas, 0, 0), BLUE);
        assert_eq!(px(canvas, 0, 1), RED); // outside the disposed region, untouched
        assert_eq!(px(canvas, 1, 0), CLEAR); // disposed column
        assert_eq!(px(canvas, 1, 1), CLEAR);
    }

    #[test]
    fn test_previous_disposal_restores_pre_draw_content() {
        let mut second = solid_frame(1, 2, 1, 0, GREEN);
        second.dispose = 2; // Previous
        let third = solid_frame(1, 1, 0, 0, BLUE);

        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second, third]);
        let mut anim = decode(&data).unwrap();

        anim.ensure_composited(2).unwrap();
        let canvas = anim.frames()[2].composited().unwrap();

        // Frame 2's region reverts to frame 1's content before frame 3 draws.
        assert_eq!(px(canvas, 0, 0), BLUE);
        assert_eq!(px(canvas, 0, 1), RED);
        assert_eq!(px(canvas, 1, 0), RED);
        assert_eq!(px(canvas, 1, 1), RED);
    }

    #[test]
    fn test_blend_source_replaces_including_alpha() {
        let second = solid_frame(2, 2, 0, 0, CLEAR);
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second]);
        let mut anim = decode(&data).unwrap();

        anim.ensure_composited(1).unwrap();
        let canvas = anim.frames()[1].composited().unwrap();

        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(px(canvas, x, y), CLEAR);
            }
        }
    }

    #[test]
    fn test_blend_over_keeps_destination_under_transparent_source() {
        let mut second = solid_frame(2, 2, 0, 0, CLEAR);
        second.blend = 1; // Over
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second]);
        let mut anim = decode(&data).unwrap();

        anim.ensure_composited(1).unwrap();
        let canvas = anim.frames()[1].composited().unwrap();

        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(px(canvas, x, y), RED);
            }
        }
    }

    #[test]
    fn test_delay_arithmetic() {
        let mut first = solid_frame(2, 2, 0, 0, RED);
        first.delay_num = 100;
        first.delay_den = 100;
        let mut second = solid_frame(2, 2, 0, 0, GREEN);
        second.delay_num = 1;
        second.delay_den = 0; // zero denominator means 100

        let data = build_rgba_apng(2, 2, &[first, second]);
        let mut anim = decode(&data).unwrap();

        let start = Instant::now();
        let mut iter = anim.iter(start);

        assert_eq!(iter.delay_ms(), 1000);
        assert!(iter.advance(start + Duration::from_millis(1000)));
        assert_eq!(iter.delay_ms(), 10);
    }

    #[test]
    fn test_advance_steps_and_wraps() {
        let second = solid_frame(2, 2, 0, 0, GREEN);
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second]);
        let mut anim = decode(&data).unwrap();

        let start = Instant::now();
        let mut iter = anim.iter(start);

        assert!(!iter.is_final_frame());
        assert!(!iter.advance(start + Duration::from_millis(9)));

        // Each frame delays 10ms; two advances spaced a delay apart move
        // exactly one frame each.
        assert!(iter.advance(start + Duration::from_millis(10)));
        assert!(iter.is_final_frame());

        assert!(iter.advance(start + Duration::from_millis(20)));
        assert!(!iter.is_final_frame()); // wrapped back to the first frame
    }

    #[test]
    fn test_advance_handles_backward_clock() {
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED)]);
        let mut anim = decode(&data).unwrap();

        let start = Instant::now() + Duration::from_secs(10);
        let mut iter = anim.iter(start);

        // The clock going backward restarts the current frame's delay.
        assert!(!iter.advance(Instant::now()));
    }

    #[test]
    fn test_cursor_bitmap_falls_back_to_last_frame() {
        let second = solid_frame(1, 1, 0, 0, GREEN);
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED), second]);
        let mut anim = decode(&data).unwrap();

        let start = Instant::now();
        let mut iter = anim.iter(start);

        let first = iter.frame_bitmap().unwrap();
        assert_eq!(px(first, 0, 0), RED);

        iter.advance(start + Duration::from_millis(10));
        let last = iter.frame_bitmap().unwrap();
        assert_eq!(px(last, 0, 0), GREEN);
        assert_eq!(px(last, 1, 1), RED);
    }

    #[test]
    fn test_truncated_stream_fails_on_finish() {
        // Two frames declared, only one supplied.
        let mut patched = Vec::new();
        patched.extend_from_slice(&PNG_SIGNATURE);
        patched.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, 8, 6)));
        patched.extend_from_slice(&chunk(b"acTL", &actl(2, 0)));
        patched.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 2, 0, 0, 1, 0, 0, 0)));
        patched.extend_from_slice(&chunk(b"IDAT", &compress(&filter0_scanlines(&solid(2, 2, RED), 2))));

        let mut decoder = ApngDecoder::new();
        decoder.feed(&patched).unwrap();
        let err = decoder.finish().unwrap_err();
        assert!(matches!(err, ApngError::CorruptImage(_)), "{:?}", err);
    }

    #[test]
    fn test_partial_frame_data_fails_on_finish() {
        let compressed = compress(&filter0_scanlines(&solid(2, 2, RED), 2));
        let half = &compressed[..compressed.len() / 2];

        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, 8, 6)));
        data.extend_from_slice(&chunk(b"acTL", &actl(1, 0)));
        data.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 2, 0, 0, 1, 0, 0, 0)));
        data.extend_from_slice(&chunk(b"IDAT", half));

        let mut decoder = ApngDecoder::new();
        decoder.feed(&data).unwrap();
        let err = decoder.finish().unwrap_err();
        assert!(matches!(err, ApngError::CorruptImage(_)), "{:?}", err);
    }

    #[test]
    fn test_indexed_decode_with_trns_override() {
        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 1, 8, 3)));
        data.extend_from_slice(&chunk(b"acTL", &actl(1, 0)));
        data.extend_from_slice(&chunk(b"PLTE", &[255, 0, 0, 0, 255, 0]));
        data.extend_from_slice(&chunk(b"tRNS", &[128]));
        data.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 1, 0, 0, 1, 0, 0, 0)));
        // One scanline: filter byte 0, then indices 0 and 1.
        data.extend_from_slice(&chunk(b"IDAT", &compress(&[0, 0, 1])));
        data.extend_from_slice(&chunk(b"IEND", &[]));

        let mut anim = decode(&data).unwrap();
        anim.ensure_composited(0).unwrap();
        let canvas = anim.frames()[0].composited().unwrap();

        assert_eq!(px(canvas, 0, 0), [255, 0, 0, 128]); // tRNS override on entry 0
        assert_eq!(px(canvas, 1, 0), [0, 255, 0, 255]);
    }

    #[test]
    fn test_indexed_scanline_with_filter_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 1, 8, 3)));
        data.extend_from_slice(&chunk(b"acTL", &actl(1, 0)));
        data.extend_from_slice(&chunk(b"PLTE", &[255, 0, 0, 0, 255, 0]));
        data.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 1, 0, 0, 1, 0, 0, 0)));
        data.extend_from_slice(&chunk(b"IDAT", &compress(&[1, 0, 1])));

        let mut decoder = ApngDecoder::new();
        let err = decoder.feed(&data).unwrap_err();
        assert!(matches!(err, ApngError::CorruptImage(_)), "{:?}", err);
    }

    #[test]
    fn test_paeth_defiltering_at_all_boundaries() {
        // 2x2 truecolor+alpha frame, both rows Paeth-filtered. The four
        // pixels exercise: no neighbors, left only, above only, and all
        // three neighbors.
        let scanlines = [
            4, 1, 2, 3, 4, 5, 6, 7, 8, //
            4, 10, 10, 10, 10, 1, 1, 1, 1,
        ];

        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, 8, 6)));
        data.extend_from_slice(&chunk(b"acTL", &actl(1, 0)));
        data.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 2, 0, 0, 1, 0, 0, 0)));
        data.extend_from_slice(&chunk(b"IDAT", &compress(&scanlines)));
        data.extend_from_slice(&chunk(b"IEND", &[]));

        let anim = decode(&data).unwrap();
        let bitmap = anim.frames()[0].bitmap();

        assert_eq!(px(bitmap, 0, 0), [1, 2, 3, 4]);
        assert_eq!(px(bitmap, 1, 0), [6, 8, 10, 12]);
        assert_eq!(px(bitmap, 0, 1), [11, 12, 13, 14]);
        assert_eq!(px(bitmap, 1, 1), [12, 13, 14, 15]);
    }

    #[test]
    fn test_unsupported_header_fields() {
        for (bit_depth, color_type) in [(16u8, 6u8), (8, 2), (8, 0), (1, 3)] {
            let mut data = Vec::new();
            data.extend_from_slice(&PNG_SIGNATURE);
            data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, bit_depth, color_type)));

            let mut decoder = ApngDecoder::new();
            let err = decoder.feed(&data).unwrap_err();
            assert!(
                matches!(err, ApngError::UnsupportedFormat(_)),
                "depth {} type {}: {:?}",
                bit_depth,
                color_type,
                err
            );
        }
    }

    #[test]
    fn test_bad_signature_is_corrupt() {
        let mut decoder = ApngDecoder::new();
        let err = decoder.feed(b"GIF89a..").unwrap_err();
        assert!(matches!(err, ApngError::CorruptImage(_)), "{:?}", err);
    }

    #[test]
    fn test_region_outside_canvas_is_corrupt() {
        let mut data = Vec::new();
        data.extend_from_slice(&PNG_SIGNATURE);
        data.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, 8, 6)));
        data.extend_from_slice(&chunk(b"acTL", &actl(1, 0)));
        data.extend_from_slice(&chunk(b"fcTL", &fctl(0, 2, 2, 1, 0, 1, 0, 0, 0)));

        let mut decoder = ApngDecoder::new();
        let err = decoder.feed(&data).unwrap_err();
        assert!(matches!(err, ApngError::CorruptImage(_)), "{:?}", err);
    }

    #[test]
    fn test_sniffing() {
        let animated = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED)]);
        assert!(is_apng(&animated));

        // A plain PNG (no acTL before IDAT) is not ours.
        let mut plain = Vec::new();
        plain.extend_from_slice(&PNG_SIGNATURE);
        plain.extend_from_slice(&chunk(b"IHDR", &ihdr(2, 2, 8, 6)));
        plain.extend_from_slice(&chunk(b"IDAT", &compress(&filter0_scanlines(&solid(2, 2, RED), 2))));
        assert!(!is_apng(&plain));

        assert!(!is_apng(b"not a png at all"));
    }

    struct RecordingHooks {
        sizes: Rc<RefCell<Vec<(u32, u32)>>>,
        first_frames: Rc<RefCell<usize>>,
    }

    impl LoaderHooks for RecordingHooks {
        fn size_ready(&mut self, width: &mut u32, height: &mut u32) {
            self.sizes.borrow_mut().push((*width, *height));
        }

        fn frame_ready(&mut self, _bitmap: &Bitmap) {
            *self.first_frames.borrow_mut() += 1;
        }
    }

    #[test]
    fn test_hooks_fire_once() {
        let sizes = Rc::new(RefCell::new(Vec::new()));
        let first_frames = Rc::new(RefCell::new(0));

        let hooks = RecordingHooks {
            sizes: Rc::clone(&sizes),
            first_frames: Rc::clone(&first_frames),
        };

        let second = solid_frame(1, 1, 0, 0, GREEN);
        let data = build_rgba_apng(3, 3, &[solid_frame(3, 3, 0, 0, RED), second]);

        let mut decoder = ApngDecoder::with_hooks(Box::new(hooks));
        decoder.feed(&data).unwrap();
        decoder.finish().unwrap();

        assert_eq!(*sizes.borrow(), vec![(3, 3)]);
        assert_eq!(*first_frames.borrow(), 1);
    }

    #[test]
    fn test_get_info_snapshot() {
        let data = build_rgba_apng(2, 2, &[solid_frame(2, 2, 0, 0, RED)]);

        let mut decoder = ApngDecoder::new();
        decoder.feed(&data).unwrap();

        let info = decoder.get_info();
        assert_eq!(info.header.as_ref().map(|h| (h.width, h.height)), Some((2, 2)));
        assert_eq!(info.animation_control.as_ref().map(|c| c.num_frames), Some(1));
        assert_eq!(info.decoded_frames, 1);
        assert_eq!(info.frame_controls.len(), 1);
        assert_eq!(info.palette_size, 0);
    }
}
