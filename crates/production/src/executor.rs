//! Ledger executor seam.
//!
//! Consensus decides the order of proposals; an [`Executor`] applies them and
//! owns the ledger configuration that decides membership. Calls run on the
//! apply pool, never on the state machine task.

use parking_lot::Mutex;
use pbft_types::{ApplicationOutcome, ApplyError, BlockNumber, Hash, LedgerConfig, Proposal};
use std::collections::BTreeMap;
use tracing::debug;

/// Applies committed proposals and reports the ledger configuration.
pub trait Executor: Send + Sync {
    /// Apply a committed proposal.
    ///
    /// Must be idempotent: after a failure or restart the same index may be
    /// submitted again, and must yield the same outcome.
    fn apply_proposal(&self, proposal: &Proposal) -> Result<ApplicationOutcome, ApplyError>;

    /// Configuration in force for the next index.
    fn current_ledger_config(&self) -> Result<LedgerConfig, ApplyError>;
}

struct LedgerInner {
    config: LedgerConfig,
    /// Post-execution digest per applied index.
    results: BTreeMap<BlockNumber, Hash>,
    /// Remaining injected failures.
    failures: u32,
}

/// Executor that keeps a running digest of applied proposals in memory.
///
/// Each result hash chains the previous one with the proposal hash, so two
/// nodes agree on a result only if they applied the same sequence.
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                config,
                results: BTreeMap::new(),
                failures: 0,
            }),
        }
    }

    /// Replace the configuration returned by the next poll.
    pub fn set_ledger_config(&self, config: LedgerConfig) {
        self.inner.lock().config = config;
    }

    /// Make the next `count` applications fail with `ApplyError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().failures = count;
    }

    pub fn applied_index(&self) -> BlockNumber {
        self.inner
            .lock()
            .results
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BlockNumber::GENESIS)
    }

    pub fn result_hash(&self, index: BlockNumber) -> Option<Hash> {
        self.inner.lock().results.get(&index).copied()
    }
}

impl Executor for MemoryLedger {
    fn apply_proposal(&self, proposal: &Proposal) -> Result<ApplicationOutcome, ApplyError> {
        let mut inner = self.inner.lock();

        if let Some(result_hash) = inner.results.get(&proposal.index) {
            debug!(index = proposal.index.0, "Proposal already applied");
            return Ok(ApplicationOutcome {
                index: proposal.index,
                result_hash: *result_hash,
            });
        }

        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(ApplyError::Unavailable("injected failure".to_string()));
        }

        let (last_index, last_result) = inner
            .results
            .iter()
            .next_back()
            .map(|(i, h)| (*i, *h))
            .unwrap_or((BlockNumber::GENESIS, Hash::ZERO));
        if proposal.index != last_index.next() {
            return Err(ApplyError::Execution(format!(
                "expected index {}, got {}",
                last_index.next(),
                proposal.index
            )));
        }

        let result_hash = Hash::from_parts(&[
            last_result.as_bytes(),
            proposal.hash.as_bytes(),
            &proposal.payload,
        ]);
        inner.results.insert(proposal.index, result_hash);

        Ok(ApplicationOutcome {
            index: proposal.index,
            result_hash,
        })
    }

    fn current_ledger_config(&self) -> Result<LedgerConfig, ApplyError> {
        Ok(self.inner.lock().config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::test_utils::{test_committee, test_keypair};
    use pbft_types::{NodeIndex, View};

    fn proposal(index: u64) -> Proposal {
        Proposal::new(
            BlockNumber(index),
            View(0),
            Hash::from_bytes(&index.to_le_bytes()),
            vec![index as u8],
            1,
            NodeIndex(0),
            &test_keypair(1),
        )
    }

    fn ledger() -> MemoryLedger {
        let (_, nodes) = test_committee(4);
        MemoryLedger::new(LedgerConfig::new(nodes))
    }

    #[test]
    fn test_apply_is_idempotent() {
        let ledger = ledger();
        let first = ledger.apply_proposal(&proposal(1)).unwrap();
        let again = ledger.apply_proposal(&proposal(1)).unwrap();
        assert_eq!(first, again);
        assert_eq!(ledger.applied_index(), BlockNumber(1));
    }

    #[test]
    fn test_apply_requires_order() {
        let ledger = ledger();
        assert!(matches!(
            ledger.apply_proposal(&proposal(2)),
            Err(ApplyError::Execution(_))
        ));
    }

    #[test]
    fn test_result_hash_depends_on_history() {
        let a = ledger();
        let b = ledger();
        a.apply_proposal(&proposal(1)).unwrap();
        b.apply_proposal(&proposal(1)).unwrap();
        let ra = a.apply_proposal(&proposal(2)).unwrap();
        let rb = b.apply_proposal(&proposal(2)).unwrap();
        assert_eq!(ra.result_hash, rb.result_hash);
        assert_ne!(ra.result_hash, a.result_hash(BlockNumber(1)).unwrap());
    }

    #[test]
    fn test_injected_failures() {
        let ledger = ledger();
        ledger.fail_next(2);
        assert!(ledger.apply_proposal(&proposal(1)).is_err());
        assert!(ledger.apply_proposal(&proposal(1)).is_err());
        assert!(ledger.apply_proposal(&proposal(1)).is_ok());
    }
}
