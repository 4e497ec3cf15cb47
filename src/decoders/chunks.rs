use crate::log_warn;
use crate::utils::error::{ApngError, ApngResult};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

// Chunk lengths are 31-bit per the PNG spec.
const MAX_CHUNK_LENGTH: usize = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkType {
    IHDR, // Image header
    PLTE, // Palette
    IDAT, // Image data (first frame)
    IEND, // End of image

    TRNS, // Transparency

    ACTL, // Animation control
    FCTL, // Frame control
    FDAT, // Frame data
}

pub fn get_chunk(chunk_type: &[u8; 4]) -> Option<ChunkType> {
    let chunk = match chunk_type {
        b"IHDR" => Some(ChunkType::IHDR),
        b"PLTE" => Some(ChunkType::PLTE),
        b"IDAT" => Some(ChunkType::IDAT),
        b"IEND" => Some(ChunkType::IEND),
        b"tRNS" => Some(ChunkType::TRNS),
        b"acTL" => Some(ChunkType::ACTL),
        b"fcTL" => Some(ChunkType::FCTL),
        b"fdAT" => Some(ChunkType::FDAT),
        _ => None,
    };

    chunk
}

/// One complete chunk pulled out of the stream. The CRC has already been
/// read and checked by the time a `RawChunk` exists.
#[derive(Debug)]
pub struct RawChunk {
    pub tag: [u8; 4],
    pub data: Vec<u8>,
}

struct CrcCalculator {
    table: [u32; 256],
}

impl CrcCalculator {
    fn new() -> Self {
        let mut table = [0u32; 256];
        for n in 0..256 {
            let mut c = n as u32;
            for _ in 0..8 {
                if c & 1 == 1 {
                    c = 0xedb88320u32 ^ (c >> 1);
                } else {
                    c = c >> 1;
                }
            }
            table[n] = c;
        }
        Self { table }
    }

    fn update_crc(&self, crc: u32, buf: &[u8]) -> u32 {
        let mut c = crc;
        for &b in buf {
            c = self.table[((c ^ u32::from(b)) & 0xff) as usize] ^ (c >> 8);
        }
        c
    }

    fn calculate_crc(&self, tag: &[u8], data: &[u8]) -> u32 {
        let crc = self.update_crc(0xffffffff, tag);
        self.update_crc(crc, data) ^ 0xffffffff
    }
}

/// Rolling buffer over an arbitrarily-fragmented byte stream that yields
/// complete length-prefixed chunks.
///
/// The first 8 bytes ever consumed must be the PNG signature. A chunk is
/// only yielded once all `length + 12` of its bytes are buffered; until
/// then the partial prefix stays in the buffer for the next feed.
pub struct ChunkReader {
    buf: Vec<u8>,
    consumed: u64,
    crc: CrcCalculator,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            consumed: 0,
            crc: CrcCalculator::new(),
        }
    }

    /// Appends newly arrived bytes to the rolling buffer.
    pub fn extend(&mut self, bytes: &[u8]) -> ApngResult<()> {
        self.buf.try_reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);

        Ok(())
    }

    /// Pulls the next complete chunk out of the buffer, or returns `None`
    /// until enough bytes have arrived.
    pub fn next_chunk(&mut self) -> ApngResult<Option<RawChunk>> {
        if self.consumed == 0 {
            if self.buf.len() < PNG_SIGNATURE.len() {
                return Ok(None);
            }

            if self.buf[..8] != PNG_SIGNATURE {
                return Err(ApngError::CorruptImage(
                    "stream does not start with the PNG signature".to_string(),
                ));
            }

            self.buf.drain(..8);
            self.consumed = 8;
        }

        if self.buf.len() < 8 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_CHUNK_LENGTH {
            return Err(ApngError::CorruptImage(format!("chunk length {} out of range", length)));
        }

        if self.buf.len() < length + 12 {
            return Ok(None);
        }

        let mut tag = [0u8; 4];
        tag.copy_from_slice(&self.buf[4..8]);

        let data = self.buf[8..8 + length].to_vec();
        let expected_crc = u32::from_be_bytes([
            self.buf[8 + length],
            self.buf[9 + length],
            self.buf[10 + length],
            self.buf[11 + length],
        ]);

        let calculated_crc = self.crc.calculate_crc(&tag, &data);
        if calculated_crc != expected_crc {
            log_warn!(
                "CRC mismatch for chunk {:?}: expected 0x{:08x}, calculated 0x{:08x}",
                String::from_utf8_lossy(&tag),
                expected_crc,
                calculated_crc
            );
        }

        self.buf.drain(..length + 12);
        self.consumed += (length + 12) as u64;

        Ok(Some(RawChunk { tag, data }))
    }
}
