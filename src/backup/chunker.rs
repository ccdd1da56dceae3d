//! Content-defined chunker (spec §4.9 "Chunker", C9).
//!
//! Splits a byte stream into variable-sized chunks bounded by
//! `min_size`/`normal_size`/`max_size`, with stable boundaries across
//! reruns of the same content (spec §8: "Idempotence"). This plays the
//! role of the teacher's `ChunkStream`/`FixedChunkStream` wrapper
//! (`backup::chunk_stream`, built over an internal `proxmox_protocol::
//! Chunker` this retrieval pack doesn't carry); the rolling-hash body is
//! learned instead from the `fastcdc` crate, which the sibling
//! backup-engine example in the pack depends on for the same purpose.

use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};

/// Chunking parameters, persisted in the repository CONFIG blob (spec
/// §4.5: `chunking{algorithm,min,normal,max}`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub algorithm: ChunkerAlgorithm,
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkerAlgorithm {
    FastCdc,
    Fixed,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            algorithm: ChunkerAlgorithm::FastCdc,
            min_size: 512 * 1024,
            normal_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_size <= self.normal_size && self.normal_size <= self.max_size) {
            return Err(RepoError::Config(
                "chunker config requires min_size <= normal_size <= max_size".into(),
            ));
        }
        if self.min_size == 0 {
            return Err(RepoError::Config("chunker min_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Splits `data` into chunks per `config`. Returns one slice range per
/// chunk; every chunk except possibly the last is within
/// `[min_size, max_size]` (spec §8 "Chunker bounds").
pub fn chunk(data: &[u8], config: &ChunkerConfig) -> Result<Vec<std::ops::Range<usize>>> {
    config.validate()?;

    if data.is_empty() {
        return Ok(Vec::new());
    }

    match config.algorithm {
        ChunkerAlgorithm::FastCdc => chunk_fastcdc(data, config),
        ChunkerAlgorithm::Fixed => Ok(chunk_fixed(data, config.normal_size as usize)),
    }
}

fn chunk_fastcdc(data: &[u8], config: &ChunkerConfig) -> Result<Vec<std::ops::Range<usize>>> {
    use fastcdc::v2020::FastCDC;

    // fastcdc requires max_size >= 3 and refuses inputs smaller than
    // min_size with a single short final chunk rather than erroring, but
    // it does require min <= avg <= max, already checked above.
    let chunker = FastCDC::new(
        data,
        config.min_size,
        config.normal_size,
        config.max_size,
    );
    let mut out = Vec::new();
    for chunk in chunker {
        out.push(chunk.offset..chunk.offset + chunk.length);
    }
    Ok(out)
}

fn chunk_fixed(data: &[u8], chunk_size: usize) -> Vec<std::ops::Range<usize>> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let end = (pos + chunk_size).min(data.len());
        out.push(pos..end);
        pos = end;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_has_no_chunks() {
        let config = ChunkerConfig::default();
        let ranges = chunk(&[], &config).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn small_file_is_single_chunk() {
        let config = ChunkerConfig::default();
        let data = b"hello dummy";
        let ranges = chunk(data, &config).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], 0..data.len());
    }

    #[test]
    fn bounds_are_respected_except_trailing() {
        let config = ChunkerConfig {
            algorithm: ChunkerAlgorithm::FastCdc,
            min_size: 1024,
            normal_size: 4096,
            max_size: 16384,
        };
        let mut data = vec![0u8; 200_000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let ranges = chunk(&data, &config).unwrap();
        assert!(!ranges.is_empty());
        for (i, r) in ranges.iter().enumerate() {
            let len = r.end - r.start;
            assert!(len as u32 <= config.max_size);
            if i != ranges.len() - 1 {
                assert!(len as u32 >= config.min_size);
            }
        }
    }

    #[test]
    fn boundaries_are_stable_across_reruns() {
        let config = ChunkerConfig::default();
        let data: Vec<u8> = (0..500_000u32).map(|i| (i % 197) as u8).collect();
        let a = chunk(&data, &config).unwrap();
        let b = chunk(&data, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ChunkerConfig {
            algorithm: ChunkerAlgorithm::FastCdc,
            min_size: 100,
            normal_size: 50,
            max_size: 10,
        };
        assert!(chunk(b"data", &config).is_err());
    }
}
