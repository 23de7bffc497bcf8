//! Priority fee handling for Solana transactions.
//!
//! Transaction builders (DLMM SDK, aggregators) frequently inject their own
//! compute-budget instructions. Before submission those are stripped and
//! replaced with exactly one unit-limit and one unit-price instruction so the
//! fee we pay is the fee we configured.
//!
//! # Example
//!
//! ```rust,ignore
//! use lpexit_chain::fee::{with_priority_fee, PriorityLevel};
//!
//! let instructions = with_priority_fee(builder_ixs, PriorityLevel::Ultra, 1_400_000);
//! ```

use serde::{Deserialize, Serialize};
use solana_sdk::compute_budget::{self, ComputeBudgetInstruction};
use solana_sdk::instruction::Instruction;
use std::fmt;
use std::str::FromStr;

/// Compute unit limit applied to every transaction we send.
pub const DEFAULT_COMPUTE_UNIT_LIMIT: u32 = 1_400_000;

/// Priority fee level, expressed as a compute unit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    /// 500k micro-lamports per CU.
    Fast,
    /// 1M micro-lamports per CU.
    #[default]
    Turbo,
    /// 2M micro-lamports per CU. Used for exits.
    Ultra,
}

impl PriorityLevel {
    /// Compute unit price in micro-lamports.
    pub fn micro_lamports(&self) -> u64 {
        match self {
            PriorityLevel::Fast => 500_000,
            PriorityLevel::Turbo => 1_000_000,
            PriorityLevel::Ultra => 2_000_000,
        }
    }

    /// Worst-case priority fee in lamports for the given unit limit.
    pub fn max_fee_lamports(&self, compute_unit_limit: u32) -> u64 {
        self.micro_lamports() * compute_unit_limit as u64 / 1_000_000
    }

    pub fn name(&self) -> &'static str {
        match self {
            PriorityLevel::Fast => "fast",
            PriorityLevel::Turbo => "turbo",
            PriorityLevel::Ultra => "ultra",
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PriorityLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(PriorityLevel::Fast),
            "turbo" => Ok(PriorityLevel::Turbo),
            "ultra" => Ok(PriorityLevel::Ultra),
            other => anyhow::bail!("Unknown priority level: {}", other),
        }
    }
}

/// Build the unit-limit and unit-price instruction pair.
pub fn priority_instructions(level: PriorityLevel, compute_unit_limit: u32) -> [Instruction; 2] {
    [
        ComputeBudgetInstruction::set_compute_unit_limit(compute_unit_limit),
        ComputeBudgetInstruction::set_compute_unit_price(level.micro_lamports()),
    ]
}

/// Check whether an instruction targets the compute budget program.
#[inline]
pub fn is_compute_budget(ix: &Instruction) -> bool {
    ix.program_id == compute_budget::id()
}

/// Remove every compute budget instruction.
pub fn strip_compute_budget(instructions: Vec<Instruction>) -> Vec<Instruction> {
    instructions
        .into_iter()
        .filter(|ix| !is_compute_budget(ix))
        .collect()
}

/// Strip builder-provided compute budget instructions and prepend our own.
///
/// Idempotent: applying it twice yields the same instruction list.
pub fn with_priority_fee(
    instructions: Vec<Instruction>,
    level: PriorityLevel,
    compute_unit_limit: u32,
) -> Vec<Instruction> {
    let body = strip_compute_budget(instructions);
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend(priority_instructions(level, compute_unit_limit));
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;

    fn dummy_ix() -> Instruction {
        Instruction::new_with_bytes(Pubkey::new_unique(), &[1, 2, 3], vec![])
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PriorityLevel::Fast.micro_lamports(), 500_000);
        assert_eq!(PriorityLevel::Turbo.micro_lamports(), 1_000_000);
        assert_eq!(PriorityLevel::Ultra.micro_lamports(), 2_000_000);
        // 2 lamports per CU * 1.4M CU
        assert_eq!(PriorityLevel::Ultra.max_fee_lamports(1_400_000), 2_800_000);
        assert_eq!(PriorityLevel::default(), PriorityLevel::Turbo);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("ULTRA".parse::<PriorityLevel>().unwrap(), PriorityLevel::Ultra);
        assert_eq!("fast".parse::<PriorityLevel>().unwrap(), PriorityLevel::Fast);
        assert!("ludicrous".parse::<PriorityLevel>().is_err());
    }

    #[test]
    fn test_with_priority_fee_replaces_existing() {
        let builder_ixs = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(200_000),
            dummy_ix(),
            ComputeBudgetInstruction::set_compute_unit_price(1),
            dummy_ix(),
        ];

        let out = with_priority_fee(builder_ixs, PriorityLevel::Ultra, DEFAULT_COMPUTE_UNIT_LIMIT);
        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().filter(|ix| is_compute_budget(ix)).count(), 2);
        assert_eq!(out[0], ComputeBudgetInstruction::set_compute_unit_limit(1_400_000));
        assert_eq!(out[1], ComputeBudgetInstruction::set_compute_unit_price(2_000_000));
        assert!(!is_compute_budget(&out[2]));
        assert!(!is_compute_budget(&out[3]));
    }

    #[test]
    fn test_with_priority_fee_idempotent() {
        let once = with_priority_fee(vec![dummy_ix()], PriorityLevel::Fast, 600_000);
        let twice = with_priority_fee(once.clone(), PriorityLevel::Fast, 600_000);
        assert_eq!(once, twice);
    }
}
