use crate::input::CandidateInput;
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use serde::Deserialize;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

/// Number of single-bit flips applied per candidate by the bit-flip strategies.
pub const BIT_FLIPS_PER_INPUT: RangeInclusive<usize> = 1..=9;
/// Number of byte replacements applied per candidate by [`RandomByteReplace`].
pub const BYTE_REPLACEMENTS_PER_INPUT: RangeInclusive<usize> = 1..=5;

/// Errors a [`MutationStrategy`] can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// The seed set is empty or every seed is zero bytes long.
    ///
    /// Recoverable: seeds may appear later, so callers log and retry.
    #[error("No usable seed inputs available")]
    NoSeeds,
}

/// Turns a pool of seeds into fresh candidate inputs.
///
/// The contract is purely "seeds in, candidates out": implementations hold their
/// own random source and keep no state between calls beyond it.
pub trait MutationStrategy: Send {
    fn name(&self) -> &'static str;

    /// Produces exactly `count` candidates, or `NoSeeds` when no seed has a byte
    /// to mutate.
    fn generate(
        &mut self,
        seeds: &[Vec<u8>],
        count: usize,
    ) -> Result<Vec<CandidateInput>, MutationError>;
}

/// Which strategy the orchestrator should build for each worker.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    BitFlip,
    ByteReplace,
    ModelGuided,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::BitFlip => "bit-flip",
            StrategyKind::ByteReplace => "byte-replace",
            StrategyKind::ModelGuided => "model-guided",
        };
        f.write_str(name)
    }
}

fn usable_seeds(seeds: &[Vec<u8>]) -> Result<Vec<&[u8]>, MutationError> {
    let usable: Vec<&[u8]> = seeds
        .iter()
        .filter(|seed| !seed.is_empty())
        .map(Vec::as_slice)
        .collect();
    if usable.is_empty() {
        Err(MutationError::NoSeeds)
    } else {
        Ok(usable)
    }
}

fn pick_seed<'a, R: Rng + ?Sized>(usable: &[&'a [u8]], rng: &mut R) -> &'a [u8] {
    usable[rng.random_range(0..usable.len())]
}

/// Copies a uniformly chosen seed and flips 1–9 random bits in it.
#[derive(Debug, Clone)]
pub struct RandomBitFlip<R: Rng> {
    rng: R,
}

impl<R: Rng> RandomBitFlip<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> MutationStrategy for RandomBitFlip<R> {
    fn name(&self) -> &'static str {
        "RandomBitFlip"
    }

    fn generate(
        &mut self,
        seeds: &[Vec<u8>],
        count: usize,
    ) -> Result<Vec<CandidateInput>, MutationError> {
        let usable = usable_seeds(seeds)?;
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let mut bytes = pick_seed(&usable, &mut self.rng).to_vec();
            let flips = self.rng.random_range(BIT_FLIPS_PER_INPUT);
            for _ in 0..flips {
                let byte_index = self.rng.random_range(0..bytes.len());
                let bit_index = self.rng.random_range(0..8u8);
                bytes[byte_index] ^= 1 << bit_index;
            }
            candidates.push(CandidateInput::from(bytes));
        }
        Ok(candidates)
    }
}

/// Copies a uniformly chosen seed and overwrites 1–5 random bytes with random values.
#[derive(Debug, Clone)]
pub struct RandomByteReplace<R: Rng> {
    rng: R,
}

impl<R: Rng> RandomByteReplace<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng + Send> MutationStrategy for RandomByteReplace<R> {
    fn name(&self) -> &'static str {
        "RandomByteReplace"
    }

    fn generate(
        &mut self,
        seeds: &[Vec<u8>],
        count: usize,
    ) -> Result<Vec<CandidateInput>, MutationError> {
        let usable = usable_seeds(seeds)?;
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let mut bytes = pick_seed(&usable, &mut self.rng).to_vec();
            let replacements = self.rng.random_range(BYTE_REPLACEMENTS_PER_INPUT);
            for _ in 0..replacements {
                let index = self.rng.random_range(0..bytes.len());
                bytes[index] = self.rng.random();
            }
            candidates.push(CandidateInput::from(bytes));
        }
        Ok(candidates)
    }
}

/// Scores byte positions of a seed for mutation.
///
/// A learned model plugs in here. The returned vector should hold one
/// non-negative weight per seed byte; anything else makes [`ModelGuided`]
/// fall back to uniform positions for that seed.
pub trait MutationModel: Send + Sync {
    fn byte_weights(&self, seed: &[u8]) -> Vec<f64>;
}

/// Bit flipping where flip positions are drawn from a [`MutationModel`]'s weights.
pub struct ModelGuided<R: Rng> {
    model: Arc<dyn MutationModel>,
    rng: R,
}

impl<R: Rng> ModelGuided<R> {
    pub fn new(model: Arc<dyn MutationModel>, rng: R) -> Self {
        Self { model, rng }
    }
}

impl<R: Rng + Send> MutationStrategy for ModelGuided<R> {
    fn name(&self) -> &'static str {
        "ModelGuided"
    }

    fn generate(
        &mut self,
        seeds: &[Vec<u8>],
        count: usize,
    ) -> Result<Vec<CandidateInput>, MutationError> {
        let usable = usable_seeds(seeds)?;
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let mut bytes = pick_seed(&usable, &mut self.rng).to_vec();
            let weights = self.model.byte_weights(&bytes);
            let positions = if weights.len() == bytes.len() {
                WeightedIndex::new(&weights).ok()
            } else {
                None
            };
            let flips = self.rng.random_range(BIT_FLIPS_PER_INPUT);
            for _ in 0..flips {
                let byte_index = match &positions {
                    Some(dist) => dist.sample(&mut self.rng),
                    None => self.rng.random_range(0..bytes.len()),
                };
                let bit_index = self.rng.random_range(0..8u8);
                bytes[byte_index] ^= 1 << bit_index;
            }
            candidates.push(CandidateInput::from(bytes));
        }
        Ok(candidates)
    }
}
