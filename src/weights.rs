//! Network weights codec.
//!
//! Weights files are a gzip-wrapped binary payload: a 32-bit magic, a format
//! version, a descriptor identifying the network's head formats, and a
//! sequence of linearly quantised 16-bit weight blocks. The loader is
//! responsible for endian-correct decoding and for fixing up older payload
//! versions into the canonical multi-head layout.
//!
//! Payload layout (all integers little-endian):
//!
//! ```text
//! u32  magic (0x1c0)
//! u32  version (1 or 2)
//! u8   input format
//! u8   policy format
//! u8   value format
//! u8   moves-left format   (version >= 2 only; fixed up to None for v1)
//! u32  block count
//! per block: u32 len, f32 min, f32 max, [u16; len] quantised values
//! ```

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

pub const WEIGHTS_MAGIC: u32 = 0x1c0;
pub const CURRENT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("weights io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic {0:#x}, expected {WEIGHTS_MAGIC:#x}")]
    BadMagic(u32),
    #[error("weights version {0} is newer than supported version {CURRENT_VERSION}")]
    VersionTooNew(u32),
    #[error("truncated weights payload at offset {0}")]
    Truncated(usize),
}

/// Head formats advertised by a weights file. Values mirror the capability
/// enums of the evaluator contract; unknown values are carried through
/// untouched so newer backends can interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub input: u8,
    pub policy: u8,
    pub value: u8,
    pub moves_left: u8,
}

/// One linearly quantised weight block: `value = min + q * (max - min) / 65535`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantisedBlock {
    pub min: f32,
    pub max: f32,
    pub values: Vec<u16>,
}

impl QuantisedBlock {
    pub fn dequantise(&self) -> Vec<f32> {
        let scale = (self.max - self.min) / 65535.0;
        self.values
            .iter()
            .map(|&q| self.min + q as f32 * scale)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightsFile {
    pub version: u32,
    pub format: FormatDescriptor,
    pub blocks: Vec<QuantisedBlock>,
    /// True when decoding applied a format fix-up; re-encoding will not be
    /// byte-identical to the original payload.
    pub fixed_up: bool,
}

/// Read and decode a gzip-wrapped weights file.
pub fn load_weights(path: &Path) -> Result<WeightsFile, WeightsError> {
    let file = File::open(path)?;
    let mut payload = Vec::new();
    GzDecoder::new(file).read_to_end(&mut payload)?;
    decode(&payload)
}

/// Encode and write a gzip-wrapped weights file.
pub fn save_weights(path: &Path, weights: &WeightsFile) -> Result<(), WeightsError> {
    let file = File::create(path)?;
    let mut enc = GzEncoder::new(file, Compression::default());
    enc.write_all(&encode(weights))?;
    enc.finish()?;
    Ok(())
}

/// Decode a decompressed payload.
pub fn decode(payload: &[u8]) -> Result<WeightsFile, WeightsError> {
    let mut r = Reader::new(payload);
    let magic = r.u32()?;
    if magic != WEIGHTS_MAGIC {
        return Err(WeightsError::BadMagic(magic));
    }
    let version = r.u32()?;
    if version > CURRENT_VERSION {
        return Err(WeightsError::VersionTooNew(version));
    }

    let input = r.u8()?;
    let policy = r.u8()?;
    let value = r.u8()?;
    // Version 1 predates the moves-left head; fix up to the canonical
    // multi-head layout with the head marked absent.
    let (moves_left, fixed_up) = if version >= 2 { (r.u8()?, false) } else { (0, true) };

    let block_count = r.u32()? as usize;
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let len = r.u32()? as usize;
        let min = r.f32()?;
        let max = r.f32()?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(r.u16()?);
        }
        blocks.push(QuantisedBlock { min, max, values });
    }

    Ok(WeightsFile {
        version: CURRENT_VERSION,
        format: FormatDescriptor {
            input,
            policy,
            value,
            moves_left,
        },
        blocks,
        fixed_up,
    })
}

/// Encode to the canonical (current-version) payload. Decoding a current
/// payload and re-encoding it yields identical bytes.
pub fn encode(weights: &WeightsFile) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&WEIGHTS_MAGIC.to_le_bytes());
    out.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    out.push(weights.format.input);
    out.push(weights.format.policy);
    out.push(weights.format.value);
    out.push(weights.format.moves_left);
    out.extend_from_slice(&(weights.blocks.len() as u32).to_le_bytes());
    for block in &weights.blocks {
        out.extend_from_slice(&(block.values.len() as u32).to_le_bytes());
        out.extend_from_slice(&block.min.to_le_bytes());
        out.extend_from_slice(&block.max.to_le_bytes());
        for &q in &block.values {
            out.extend_from_slice(&q.to_le_bytes());
        }
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WeightsError> {
        if self.pos + n > self.data.len() {
            return Err(WeightsError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WeightsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WeightsError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WeightsError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32, WeightsError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WeightsFile {
        WeightsFile {
            version: CURRENT_VERSION,
            format: FormatDescriptor {
                input: 1,
                policy: 0,
                value: 1,
                moves_left: 1,
            },
            blocks: vec![
                QuantisedBlock {
                    min: -1.0,
                    max: 1.0,
                    values: vec![0, 32767, 65535],
                },
                QuantisedBlock {
                    min: 0.0,
                    max: 4.0,
                    values: vec![16384; 7],
                },
            ],
            fixed_up: false,
        }
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let payload = encode(&sample());
        let decoded = decode(&payload).unwrap();
        assert!(!decoded.fixed_up);
        assert_eq!(encode(&decoded), payload);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut payload = encode(&sample());
        payload[0] ^= 0xff;
        assert!(matches!(
            decode(&payload),
            Err(WeightsError::BadMagic(_))
        ));
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut payload = encode(&sample());
        payload[4..8].copy_from_slice(&(CURRENT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode(&payload),
            Err(WeightsError::VersionTooNew(_))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = encode(&sample());
        assert!(matches!(
            decode(&payload[..payload.len() - 3]),
            Err(WeightsError::Truncated(_))
        ));
    }

    #[test]
    fn v1_payload_is_fixed_up() {
        // Hand-build a version-1 payload: no moves-left byte, no blocks.
        let mut payload = Vec::new();
        payload.extend_from_slice(&WEIGHTS_MAGIC.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&[1, 0, 0]);
        payload.extend_from_slice(&0u32.to_le_bytes());
        let decoded = decode(&payload).unwrap();
        assert!(decoded.fixed_up);
        assert_eq!(decoded.version, CURRENT_VERSION);
        assert_eq!(decoded.format.moves_left, 0);
    }

    #[test]
    fn dequantise_endpoints() {
        let block = QuantisedBlock {
            min: -1.0,
            max: 1.0,
            values: vec![0, 65535],
        };
        let vals = block.dequantise();
        assert!((vals[0] + 1.0).abs() < 1e-6);
        assert!((vals[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gzip_roundtrip_through_disk() {
        let dir = std::env::temp_dir().join("goshawk-weights-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("net.gz");
        save_weights(&path, &sample()).unwrap();
        let loaded = load_weights(&path).unwrap();
        assert_eq!(loaded, sample());
        std::fs::remove_file(&path).ok();
    }
}
