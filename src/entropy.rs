//! Local entropy sources feeding each pulse's `localRandomValue`.
//!
//! The pool is a fixed, ordered list of sources. Each cycle every source
//! contributes raw bytes and the local random value is the SHA-512 over their
//! length-prefixed encodings, in pool order.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use crate::crypto::hash_many;
use crate::types::ByteHash;

#[derive(Error, Debug)]
pub enum EntropyError {
    #[error("Entropy source {source_name} failed: {message}")]
    SourceFailed { source_name: String, message: String },
    #[error("Entropy pool has no sources")]
    NoSources,
}

/// Produces raw unpredictable bytes once per cycle.
pub trait EntropySource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch(&self) -> Result<Vec<u8>, EntropyError>;
}

/// Operating system CSPRNG.
pub struct OsEntropy {
    bytes: usize,
}

impl OsEntropy {
    pub fn new(bytes: usize) -> Self {
        Self { bytes }
    }
}

impl Default for OsEntropy {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EntropySource for OsEntropy {
    fn name(&self) -> &str {
        "os"
    }

    fn fetch(&self) -> Result<Vec<u8>, EntropyError> {
        let mut buf = vec![0u8; self.bytes];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| EntropyError::SourceFailed {
                source_name: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(buf)
    }
}

/// Timing jitter of a short busy loop, sampled from the monotonic clock.
/// Only the low byte of each nanosecond delta is kept.
pub struct ClockJitterEntropy {
    samples: usize,
}

impl ClockJitterEntropy {
    pub fn new(samples: usize) -> Self {
        Self { samples }
    }
}

impl Default for ClockJitterEntropy {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EntropySource for ClockJitterEntropy {
    fn name(&self) -> &str {
        "clock-jitter"
    }

    fn fetch(&self) -> Result<Vec<u8>, EntropyError> {
        let mut out = Vec::with_capacity(self.samples);
        let mut acc: u64 = 0;
        let mut last = Instant::now();
        for i in 0..self.samples {
            // uneven work between samples so the loop does not settle into a fixed cadence
            for j in 0..(16 + (acc as usize & 0x3f)) {
                acc = acc.wrapping_mul(6364136223846793005).wrapping_add((i ^ j) as u64);
            }
            let now = Instant::now();
            let delta = now.duration_since(last).as_nanos() as u64;
            out.push((delta ^ acc) as u8);
            last = now;
        }
        Ok(out)
    }
}

/// Fixed list of local sources combined into one local random value.
pub struct EntropyPool {
    sources: Vec<Box<dyn EntropySource>>,
}

impl EntropyPool {
    pub fn new(sources: Vec<Box<dyn EntropySource>>) -> Self {
        Self { sources }
    }

    /// OS CSPRNG followed by clock jitter.
    pub fn local() -> Self {
        Self::new(vec![
            Box::new(OsEntropy::default()),
            Box::new(ClockJitterEntropy::default()),
        ])
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Fetch every source and hash the results into a local random value.
    pub fn local_random_value(&self) -> Result<ByteHash, EntropyError> {
        if self.sources.is_empty() {
            return Err(EntropyError::NoSources);
        }

        let mut values = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let bytes = source.fetch()?;
            debug!(source = source.name(), bytes = bytes.len(), "entropy fetched");
            values.push(bytes);
        }

        Ok(hash_many(values.iter().map(|v| v.as_slice())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<u8>);

    impl EntropySource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }
        fn fetch(&self) -> Result<Vec<u8>, EntropyError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    impl EntropySource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }
        fn fetch(&self) -> Result<Vec<u8>, EntropyError> {
            Err(EntropyError::SourceFailed {
                source_name: "broken".into(),
                message: "device unplugged".into(),
            })
        }
    }

    #[test]
    fn test_pool_hashes_sources_in_order() {
        let pool = EntropyPool::new(vec![
            Box::new(FixedSource(vec![1, 2, 3])),
            Box::new(FixedSource(vec![4, 5])),
        ]);
        let expected = hash_many([&[1u8, 2, 3][..], &[4u8, 5][..]]);
        assert_eq!(pool.local_random_value().unwrap(), expected);
    }

    #[test]
    fn test_local_pool_values_differ() {
        let pool = EntropyPool::local();
        assert_eq!(pool.source_names(), vec!["os", "clock-jitter"]);

        let a = pool.local_random_value().unwrap();
        let b = pool.local_random_value().unwrap();
        assert_eq!(a.as_bytes().len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_failing_source_propagates() {
        let pool = EntropyPool::new(vec![Box::new(OsEntropy::default()), Box::new(BrokenSource)]);
        assert!(matches!(
            pool.local_random_value(),
            Err(EntropyError::SourceFailed { .. })
        ));
        assert!(matches!(
            EntropyPool::new(vec![]).local_random_value(),
            Err(EntropyError::NoSources)
        ));
    }
}
