//! Skip-list indexing over pulse indices.
//!
//! A pulse whose index is a multiple of `n^k` anchors up to layer `k`, so a
//! pulse's `k`-th anchor is the output value of the latest earlier pulse whose
//! index is a multiple of `n^k`. Audit paths hop along those anchors and need
//! `O(log_n(dst - src))` pulses instead of every pulse in between.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ByteHash;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SkipListError {
    #[error("Invalid skip list range: {from} is after {to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("Invalid skip list geometry: layer size {layer_size}, {num_layers} layers")]
    InvalidGeometry { layer_size: u32, num_layers: u32 },
    #[error("Expected {expected} layer indices, got {got}")]
    WrongLayerCount { expected: usize, got: usize },
    #[error("Layer indices do not fit in a pulse index")]
    Overflow,
}

/// Skip-list geometry: `layer_size` (n) and `num_layers` (L).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipLayers {
    layer_size: u32,
    num_layers: u32,
}

impl SkipLayers {
    pub fn new(layer_size: u32, num_layers: u32) -> Result<Self, SkipListError> {
        // n^(L-1) must fit in a u64
        let fits = (layer_size as u64)
            .checked_pow(num_layers.saturating_sub(1))
            .is_some();
        if layer_size < 2 || num_layers == 0 || !fits {
            return Err(SkipListError::InvalidGeometry { layer_size, num_layers });
        }
        Ok(Self { layer_size, num_layers })
    }

    pub fn layer_size(&self) -> u32 {
        self.layer_size
    }

    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    fn power(&self, layer: u32) -> u64 {
        (self.layer_size as u64).pow(layer)
    }

    /// Mixed-radix digits of `index`, most significant layer first.
    /// The top digit is unbounded.
    pub fn to_layer_indices(&self, index: u64) -> Vec<u64> {
        let mut rest = index;
        (0..self.num_layers)
            .rev()
            .map(|layer| {
                let power = self.power(layer);
                let digit = rest / power;
                rest %= power;
                digit
            })
            .collect()
    }

    pub fn from_layer_indices(&self, digits: &[u64]) -> Result<u64, SkipListError> {
        if digits.len() != self.num_layers as usize {
            return Err(SkipListError::WrongLayerCount {
                expected: self.num_layers as usize,
                got: digits.len(),
            });
        }
        digits
            .iter()
            .zip((0..self.num_layers).rev())
            .try_fold(0u64, |acc, (digit, layer)| {
                digit
                    .checked_mul(self.power(layer))
                    .and_then(|term| acc.checked_add(term))
            })
            .ok_or(SkipListError::Overflow)
    }

    /// Largest `k` in `[0, L-1]` such that `index` is divisible by `n^k`.
    pub fn highest_layer_power(&self, index: u64) -> u32 {
        let n = self.layer_size as u64;
        let mut k = 0;
        let mut rest = index;
        while k + 1 < self.num_layers && rest % n == 0 {
            if rest == 0 {
                return self.num_layers - 1;
            }
            rest /= n;
            k += 1;
        }
        k
    }

    /// All-zero sentinel anchors of a chain's first pulse.
    pub fn sentinel_anchors(&self) -> Vec<ByteHash> {
        vec![ByteHash::zero(); self.num_layers as usize]
    }

    /// Anchors of the pulse following `previous_index`: the first
    /// `1 + highest_layer_power(previous_index)` layers point at the previous
    /// output value, the rest are inherited from the previous anchors.
    pub fn next_anchors(
        &self,
        previous_index: u64,
        previous_output: &ByteHash,
        previous_anchors: &[ByteHash],
    ) -> Vec<ByteHash> {
        let linked = 1 + self.highest_layer_power(previous_index) as usize;
        let mut anchors = vec![previous_output.clone(); linked];
        anchors.extend(previous_anchors.iter().skip(linked).cloned());
        anchors
    }

    /// True when pulse `to` carries the output of pulse `from` among its anchors.
    pub fn is_hop(&self, from: u64, to: u64) -> bool {
        if from >= to {
            return false;
        }
        (0..self.num_layers).any(|layer| {
            let power = self.power(layer);
            from % power == 0 && to - from <= power
        })
    }

    /// Increasing sequence of indices forming the audit path from `src` to `dst`.
    /// Empty when `src == dst`.
    pub fn path(&self, src: u64, dst: u64) -> Result<Vec<u64>, SkipListError> {
        if src > dst {
            return Err(SkipListError::InvalidRange { from: src, to: dst });
        }
        if src == dst {
            return Ok(Vec::new());
        }

        let n = self.layer_size as u64;
        let gap = dst - src;
        let mut top = 0;
        while top + 1 < self.num_layers && self.power(top) <= gap / n {
            top += 1;
        }

        // collected from dst backwards, reversed at the end
        let mut reversed = vec![dst];
        let mut curr = dst - dst % self.power(top);
        if curr != dst {
            reversed.push(curr);
        }
        for layer in (0..=top).rev() {
            let step = self.power(layer);
            while curr - src > step {
                curr -= step;
                reversed.push(curr);
            }
        }
        reversed.push(src);
        reversed.reverse();
        Ok(reversed)
    }
}
