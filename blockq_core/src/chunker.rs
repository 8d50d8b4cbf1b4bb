//! Splitting byte streams into chunks.
//!
//! Two strategies are supported: fixed-size chunks and content-defined
//! chunks (FastCDC, named `rabin` on the command line). A chunker is
//! described by a short string:
//!
//! - `""` / `"default"`: fixed 256 KiB chunks
//! - `"size-N"`: fixed N-byte chunks
//! - `"rabin"`: content-defined, 256 KiB average
//! - `"rabin-AVG"`: content-defined, min = AVG/3, max = AVG + AVG/2
//! - `"rabin-MIN-AVG-MAX"`: content-defined, explicit bounds

use crate::error::{Error, Result};
use fastcdc::v2020::{self, StreamCDC};
use std::io::{self, Read};

/// Default chunk size (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;

/// Largest chunk any strategy may produce (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1_048_576;

/// A parsed chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerSpec {
    /// Fixed-size chunks; the last one may be shorter.
    Fixed(usize),
    /// Content-defined chunks with the given size bounds.
    Rabin { min: u32, avg: u32, max: u32 },
}

impl Default for ChunkerSpec {
    fn default() -> Self {
        ChunkerSpec::Fixed(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkerSpec {
    /// Parse a chunker description.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "default" {
            return Ok(Self::default());
        }

        if let Some(size) = s.strip_prefix("size-") {
            let size: usize = parse_size(size)?;
            if size == 0 {
                return Err(Error::invalid_configuration("chunk size must be greater than 0"));
            }
            if size > MAX_CHUNK_SIZE {
                return Err(Error::invalid_configuration(format!(
                    "chunk size {} exceeds the maximum of {}",
                    size, MAX_CHUNK_SIZE
                )));
            }
            return Ok(ChunkerSpec::Fixed(size));
        }

        if s == "rabin" {
            return Self::rabin_avg(DEFAULT_CHUNK_SIZE as u32);
        }

        if let Some(params) = s.strip_prefix("rabin-") {
            let parts: Vec<&str> = params.split('-').collect();
            return match parts.as_slice() {
                [avg] => Self::rabin_avg(parse_size(avg)?),
                [min, avg, max] => {
                    Self::rabin(parse_size(min)?, parse_size(avg)?, parse_size(max)?)
                }
                _ => Err(Error::invalid_configuration(format!(
                    "incorrect format for rabin chunker: {}",
                    s
                ))),
            };
        }

        Err(Error::invalid_configuration(format!("unrecognized chunker option: {}", s)))
    }

    fn rabin_avg(avg: u32) -> Result<Self> {
        Self::rabin(avg / 3, avg, avg + avg / 2)
    }

    fn rabin(min: u32, avg: u32, max: u32) -> Result<Self> {
        // StreamCDC panics outside its bounds, so reject them here.
        let in_range = (v2020::MINIMUM_MIN..=v2020::MINIMUM_MAX).contains(&min)
            && (v2020::AVERAGE_MIN..=v2020::AVERAGE_MAX).contains(&avg)
            && (v2020::MAXIMUM_MIN..=v2020::MAXIMUM_MAX).contains(&max);
        if !in_range || min >= avg || avg >= max {
            return Err(Error::invalid_configuration(format!(
                "invalid rabin bounds min={} avg={} max={}",
                min, avg, max
            )));
        }
        if max as usize > MAX_CHUNK_SIZE {
            return Err(Error::invalid_configuration(format!(
                "rabin max {} exceeds the maximum chunk size of {}",
                max, MAX_CHUNK_SIZE
            )));
        }
        Ok(ChunkerSpec::Rabin { min, avg, max })
    }

    /// Split `reader` lazily.
    pub fn splitter<R: Read>(&self, reader: R) -> Splitter<R> {
        let inner = match *self {
            ChunkerSpec::Fixed(size) => Inner::Fixed { reader, size },
            ChunkerSpec::Rabin { min, avg, max } => {
                Inner::Rabin(Box::new(StreamCDC::new(reader, min, avg, max)))
            }
        };
        Splitter {
            inner,
            offset: 0,
            done: false,
        }
    }
}

impl std::fmt::Display for ChunkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkerSpec::Fixed(size) => write!(f, "size-{}", size),
            ChunkerSpec::Rabin { min, avg, max } => write!(f, "rabin-{}-{}-{}", min, avg, max),
        }
    }
}

fn parse_size<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::invalid_configuration(format!("invalid chunker size: {}", s)))
}

/// A chunk of input and where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

enum Inner<R: Read> {
    Fixed { reader: R, size: usize },
    Rabin(Box<StreamCDC<R>>),
}

/// Forward-only iterator over the chunks of a stream.
///
/// Never yields an empty chunk. The first error ends the sequence.
pub struct Splitter<R: Read> {
    inner: Inner<R>,
    offset: u64,
    done: bool,
}

impl<R: Read> Splitter<R> {
    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.inner {
            Inner::Fixed { reader, size } => {
                let mut buf = vec![0u8; *size];
                let mut filled = 0;
                while filled < buf.len() {
                    match reader.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                buf.truncate(filled);
                Ok((filled > 0).then_some(buf))
            }
            Inner::Rabin(cdc) => match cdc.next() {
                None | Some(Err(v2020::Error::Empty)) => Ok(None),
                Some(Ok(chunk)) => Ok(Some(chunk.data)),
                Some(Err(v2020::Error::IoError(e))) => Err(e.into()),
                Some(Err(e)) => Err(Error::backend(format!("chunker: {}", e))),
            },
        }
    }
}

impl<R: Read> Iterator for Splitter<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(data)) if !data.is_empty() => {
                let offset = self.offset;
                self.offset += data.len() as u64;
                Some(Ok(Chunk { offset, data }))
            }
            Ok(_) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn collect(spec: ChunkerSpec, data: &[u8]) -> Vec<Chunk> {
        spec.splitter(data).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(ChunkerSpec::parse("").unwrap(), ChunkerSpec::Fixed(262_144));
        assert_eq!(ChunkerSpec::parse("default").unwrap(), ChunkerSpec::Fixed(262_144));
        assert_eq!(ChunkerSpec::parse("size-1024").unwrap(), ChunkerSpec::Fixed(1024));
        assert_eq!(
            ChunkerSpec::parse("rabin").unwrap(),
            ChunkerSpec::Rabin {
                min: 87_381,
                avg: 262_144,
                max: 393_216
            }
        );
        assert_eq!(
            ChunkerSpec::parse("rabin-3000").unwrap(),
            ChunkerSpec::Rabin {
                min: 1000,
                avg: 3000,
                max: 4500
            }
        );
        assert_eq!(
            ChunkerSpec::parse("rabin-128-1024-4096").unwrap(),
            ChunkerSpec::Rabin {
                min: 128,
                avg: 1024,
                max: 4096
            }
        );
        assert_eq!(
            ChunkerSpec::parse("rabin-64-256-1024").unwrap(),
            ChunkerSpec::Rabin {
                min: 64,
                avg: 256,
                max: 1024
            }
        );
    }

    #[test]
    fn test_rabin_bounds_at_fastcdc_limits() {
        // Smallest accepted triple.
        assert!(ChunkerSpec::parse("rabin-64-256-1024").is_ok());
        // Below each lower limit.
        assert!(ChunkerSpec::parse("rabin-63-256-1024").is_err());
        assert!(ChunkerSpec::parse("rabin-64-255-1024").is_err());
        assert!(ChunkerSpec::parse("rabin-64-256-1023").is_err());
        // Within fastcdc's limits but above the chunk cap.
        assert!(ChunkerSpec::parse("rabin-65536-262144-2097152").is_err());
    }

    #[test]
    fn test_default_rabin_splits_large_input() {
        let data: Vec<u8> = (0..1_500_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 11) as u8)
            .collect();
        let chunks = collect(ChunkerSpec::parse("rabin").unwrap(), &data);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.data.len() <= 393_216);
        }
        let total: usize = chunks.iter().map(|c| c.data.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_parse_rejects() {
        for bad in [
            "size-0",
            "size-abc",
            "size-2000000",
            "rabin-1-2",
            "rabin-10-20-30",
            "rabin-4096-1024-8192",
            "buzhash",
        ] {
            let err = ChunkerSpec::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration, "{}", bad);
        }
    }

    #[test]
    fn test_fixed_sizes_and_offsets() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let chunks = collect(ChunkerSpec::Fixed(1000), &data);

        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        let offsets: Vec<u64> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 1000, 2000]);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(collect(ChunkerSpec::default(), b"").is_empty());
        assert!(collect(ChunkerSpec::parse("rabin").unwrap(), b"").is_empty());
    }

    #[test]
    fn test_rabin_respects_max() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        let spec = ChunkerSpec::parse("rabin-256-1024-4096").unwrap();
        let chunks = collect(spec, &data);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.data.len() <= 4096);
        }
        let total: usize = chunks.iter().map(|c| c.data.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_read_error_ends_sequence() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("disk on fire"))
            }
        }

        let mut splitter = ChunkerSpec::default().splitter(Failing);
        let err = splitter.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert!(splitter.next().is_none());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        /// Concatenating the chunks reproduces the input, with no empty chunk.
        #[test]
        fn prop_chunks_reassemble(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            size in 1usize..5000,
            rabin in any::<bool>(),
        ) {
            let spec = if rabin {
                ChunkerSpec::parse("rabin-64-256-1024").unwrap()
            } else {
                ChunkerSpec::Fixed(size)
            };
            let chunks = collect(spec, &data);

            let mut joined = Vec::with_capacity(data.len());
            for chunk in &chunks {
                prop_assert!(!chunk.data.is_empty());
                prop_assert_eq!(chunk.offset, joined.len() as u64);
                joined.extend_from_slice(&chunk.data);
            }
            prop_assert_eq!(joined, data);
        }
    }
}
