//! Validator (spec §4 component table, §4.3): cross-checks UBT state
//! against the canonical source via the replay client, in sampled or
//! strict mode, tolerating "historical state unavailable" gracefully.

use crate::applier::Applier;
use crate::error::ConsumerError;
use crate::metrics::{VALIDATION_MISMATCHES, VALIDATION_RUNS};
use crate::replay::ReplayClient;
use crate::types::{BlockNumber, QueuedDiff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Sampled,
}

pub struct Validator {
    halt_on_mismatch: bool,
}

impl Validator {
    pub fn new(halt_on_mismatch: bool) -> Self {
        Self { halt_on_mismatch }
    }

    /// Compares the just-applied diff's effects against the live trie at
    /// `root` for every touched address. Returns `Ok(())` on match,
    /// `Err(ConsumerError::ValidationHalt)` when `halt_on_mismatch` is set
    /// and a mismatch is found, otherwise logs and counts the mismatch.
    pub fn validate_against_diff(
        &self,
        applier: &Applier,
        root: [u8; 32],
        block: BlockNumber,
        diff: &QueuedDiff,
        mode: ValidationMode,
    ) -> Result<(), ConsumerError> {
        let mode_label = match mode {
            ValidationMode::Strict => "strict",
            ValidationMode::Sampled => "sampled",
        };
        VALIDATION_RUNS.with_label_values(&[mode_label]).inc();

        let view = applier.trie_at(root).map_err(ConsumerError::from)?;
        use crate::trie::MutableTrie;

        for account in &diff.accounts {
            if !account.alive {
                continue;
            }
            let balance = view.get_balance(&account.address).map_err(ConsumerError::from)?;
            let matches = balance.as_deref() == Some(account.balance.as_slice());
            if !matches {
                VALIDATION_MISMATCHES.inc();
                tracing::warn!(block, address = %hex::encode(account.address), "validation mismatch on balance");
                if self.halt_on_mismatch {
                    return Err(ConsumerError::ValidationHalt {
                        block,
                        address: account.address,
                        expected: account.balance.clone(),
                        actual: balance.unwrap_or_default(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Cross-checks against the archive RPC rather than the local trie,
    /// used for the "re-derive from outbox" universal invariant check.
    /// Treats archive "historical state unavailable" errors as non-fatal.
    pub async fn validate_against_archive(
        &self,
        replay: &ReplayClient,
        block: BlockNumber,
        diff: &QueuedDiff,
    ) -> Result<(), ConsumerError> {
        for account in &diff.accounts {
            if !account.alive {
                continue;
            }
            let archived = match replay.get_balance(&account.address, block).await {
                Ok(balance) => balance,
                Err(_) => continue,
            };
            if archived != account.balance {
                VALIDATION_MISMATCHES.inc();
                tracing::warn!(block, address = %hex::encode(account.address), "archive validation mismatch");
                if self.halt_on_mismatch {
                    return Err(ConsumerError::ValidationHalt {
                        block,
                        address: account.address,
                        expected: archived,
                        actual: account.balance.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Deterministic "every Nth applied block" sampler (DESIGN.md D1): strict
/// modulus semantics, not a probability draw.
pub fn is_sampled_block(block: BlockNumber, sample_rate: u64) -> bool {
    if sample_rate == 0 {
        return false;
    }
    block % sample_rate == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_fires_every_nth_block_deterministically() {
        assert!(is_sampled_block(0, 100));
        assert!(!is_sampled_block(1, 100));
        assert!(is_sampled_block(100, 100));
        assert!(is_sampled_block(200, 100));
    }

    #[test]
    fn sampler_disabled_with_zero_rate() {
        assert!(!is_sampled_block(0, 0));
        assert!(!is_sampled_block(100, 0));
    }
}
