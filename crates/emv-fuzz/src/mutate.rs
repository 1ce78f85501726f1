//! Command mutators
//!
//! Random strategies draw from a seeded `StdRng`, so a preset and its seed
//! always produce the same command stream. Sweep-style strategies are
//! deterministic lists truncated to the requested count.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::FuzzError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzStrategy {
    /// Flip one random bit anywhere in the command
    BitFlip,
    /// Replace the data field with random bytes
    RandomData,
    /// Walk P1, P2 and Le through edge values
    BoundaryValues,
    /// Try every other instruction byte with the same parameters
    InstructionSweep,
    /// Lc and Le that disagree with the data actually sent
    LengthMismatch,
}

impl FuzzStrategy {
    pub const ALL: [FuzzStrategy; 5] = [
        FuzzStrategy::BitFlip,
        FuzzStrategy::RandomData,
        FuzzStrategy::BoundaryValues,
        FuzzStrategy::InstructionSweep,
        FuzzStrategy::LengthMismatch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FuzzStrategy::BitFlip => "bit_flip",
            FuzzStrategy::RandomData => "random_data",
            FuzzStrategy::BoundaryValues => "boundary_values",
            FuzzStrategy::InstructionSweep => "instruction_sweep",
            FuzzStrategy::LengthMismatch => "length_mismatch",
        }
    }
}

impl fmt::Display for FuzzStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FuzzStrategy {
    type Err = FuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        FuzzStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == wanted)
            .ok_or_else(|| FuzzError::UnknownStrategy(s.to_string()))
    }
}

const BOUNDARY_BYTES: [u8; 6] = [0x00, 0x01, 0x7F, 0x80, 0xFE, 0xFF];

/// Short-form command split into its fields
#[derive(Debug, Clone, PartialEq, Eq)]
struct Apdu {
    header: [u8; 4],
    data: Vec<u8>,
    le: Option<u8>,
}

impl Apdu {
    /// Callers guarantee at least four bytes
    fn parse(bytes: &[u8]) -> Self {
        let header = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let body = &bytes[4..];
        let (data, le) = match body {
            [] => (Vec::new(), None),
            [le] => (Vec::new(), Some(*le)),
            [lc, rest @ ..] if rest.len() == *lc as usize => (rest.to_vec(), None),
            [lc, rest @ .., le] if rest.len() == *lc as usize => (rest.to_vec(), Some(*le)),
            // Already inconsistent: keep everything after the header as data
            _ => (body.to_vec(), None),
        };
        Self { header, data, le }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = self.header.to_vec();
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        out.extend(self.le);
        out
    }
}

/// Seeded generator of mutated commands
#[derive(Debug, Clone)]
pub struct Mutator {
    rng: StdRng,
}

impl Mutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Up to `count` mutations of `base`; never returns `base` itself
    ///
    /// `base` must hold at least a four-byte command header.
    pub fn mutations(&mut self, strategy: FuzzStrategy, base: &[u8], count: usize) -> Vec<Vec<u8>> {
        if base.len() < 4 || count == 0 {
            return Vec::new();
        }
        let apdu = Apdu::parse(base);
        let candidates = match strategy {
            FuzzStrategy::BitFlip => (0..count).map(|_| self.bit_flip(base)).collect(),
            FuzzStrategy::RandomData => (0..count).map(|_| self.random_data(&apdu)).collect(),
            FuzzStrategy::BoundaryValues => boundary_values(&apdu),
            FuzzStrategy::InstructionSweep => instruction_sweep(&apdu),
            FuzzStrategy::LengthMismatch => length_mismatch(&apdu),
        };
        candidates
            .into_iter()
            .filter(|candidate: &Vec<u8>| candidate.as_slice() != base)
            .take(count)
            .collect()
    }

    fn bit_flip(&mut self, base: &[u8]) -> Vec<u8> {
        let mut mutated = base.to_vec();
        let index = self.rng.gen_range(0..mutated.len());
        let bit = self.rng.gen_range(0..8u8);
        mutated[index] ^= 1 << bit;
        mutated
    }

    fn random_data(&mut self, apdu: &Apdu) -> Vec<u8> {
        let len = if apdu.data.is_empty() {
            self.rng.gen_range(1..=16usize)
        } else {
            apdu.data.len()
        };
        let mut data = vec![0u8; len];
        self.rng.fill_bytes(&mut data);
        Apdu {
            data,
            ..apdu.clone()
        }
        .encode()
    }
}

fn boundary_values(apdu: &Apdu) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for position in [2usize, 3] {
        for value in BOUNDARY_BYTES {
            let mut variant = apdu.clone();
            variant.header[position] = value;
            out.push(variant.encode());
        }
    }
    for le in [0x00, 0x01, 0xFF] {
        out.push(
            Apdu {
                le: Some(le),
                ..apdu.clone()
            }
            .encode(),
        );
    }
    out
}

/// INS values 6X and 9X are T=0 procedure bytes and are skipped
fn instruction_sweep(apdu: &Apdu) -> Vec<Vec<u8>> {
    (0..=u8::MAX)
        .filter(|ins| !matches!(ins >> 4, 0x6 | 0x9))
        .filter(|ins| *ins != apdu.header[1])
        .map(|ins| {
            let mut variant = apdu.clone();
            variant.header[1] = ins;
            variant.encode()
        })
        .collect()
}

fn length_mismatch(apdu: &Apdu) -> Vec<Vec<u8>> {
    let header = apdu.header.to_vec();
    let data = &apdu.data;
    let with_lc = |lc: u8, body: &[u8], le: Option<u8>| {
        let mut out = header.clone();
        out.push(lc);
        out.extend_from_slice(body);
        out.extend(le);
        out
    };

    let declared = data.len() as u8;
    let mut out = vec![
        // Lc promises one byte more than sent
        with_lc(declared.wrapping_add(1), data, None),
        // Lc at the maximum
        with_lc(0xFF, data, apdu.le),
        // Lc with no data at all
        with_lc(declared.max(1), &[], None),
    ];
    if !data.is_empty() {
        out.push(with_lc(declared - 1, data, apdu.le));
        out.push(with_lc(0x00, data, apdu.le));
    }
    // Two trailing Le bytes
    let mut doubled = apdu.encode();
    doubled.extend([apdu.le.unwrap_or(0x00), 0x00]);
    out.push(doubled);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECT: [u8; 12] = [
        0x00, 0xA4, 0x04, 0x00, 0x06, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x00,
    ];

    #[test]
    fn test_same_seed_same_stream() {
        let a = Mutator::new(7).mutations(FuzzStrategy::BitFlip, &SELECT, 20);
        let b = Mutator::new(7).mutations(FuzzStrategy::BitFlip, &SELECT, 20);
        let c = Mutator::new(8).mutations(FuzzStrategy::BitFlip, &SELECT, 20);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_bit_flip_changes_one_bit() {
        for mutated in Mutator::new(1).mutations(FuzzStrategy::BitFlip, &SELECT, 50) {
            let flipped: u32 = mutated
                .iter()
                .zip(SELECT.iter())
                .map(|(a, b)| (a ^ b).count_ones())
                .sum();
            assert_eq!(flipped, 1);
        }
    }

    #[test]
    fn test_random_data_keeps_lc_consistent() {
        for mutated in Mutator::new(3).mutations(FuzzStrategy::RandomData, &SELECT, 10) {
            assert_eq!(mutated.len(), SELECT.len());
            assert_eq!(&mutated[..5], &SELECT[..5]);
        }
    }

    #[test]
    fn test_instruction_sweep() {
        let sweep = Mutator::new(0).mutations(FuzzStrategy::InstructionSweep, &SELECT, 500);
        assert_eq!(sweep.len(), 256 - 32 - 1);
        assert!(sweep.iter().all(|c| c[1] != 0xA4 && c[1] >> 4 != 0x6 && c[1] >> 4 != 0x9));
        assert!(sweep.iter().all(|c| c[2..] == SELECT[2..]));
    }

    #[test]
    fn test_boundary_values_skip_base() {
        let read_record = [0x00, 0xB2, 0x01, 0x0C, 0x00];
        let values = Mutator::new(0).mutations(FuzzStrategy::BoundaryValues, &read_record, 100);
        assert!(!values.iter().any(|v| v.as_slice() == read_record));
        assert!(values.contains(&vec![0x00, 0xB2, 0xFF, 0x0C, 0x00]));
        assert!(values.contains(&vec![0x00, 0xB2, 0x01, 0x0C, 0xFF]));
    }

    #[test]
    fn test_length_mismatch_disagrees() {
        for mutated in Mutator::new(0).mutations(FuzzStrategy::LengthMismatch, &SELECT, 10) {
            let body = mutated.len() - 5;
            let lc = mutated[4] as usize;
            assert!(lc != body && lc + 1 != body, "{}", hex::encode_upper(&mutated));
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("bit-flip".parse::<FuzzStrategy>().unwrap(), FuzzStrategy::BitFlip);
        assert_eq!(
            "instruction_sweep".parse::<FuzzStrategy>().unwrap(),
            FuzzStrategy::InstructionSweep
        );
        assert!("chaos".parse::<FuzzStrategy>().is_err());
    }
}
