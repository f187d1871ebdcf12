//! In-process executor for simulated nodes.

use pbft_types::{ApplicationOutcome, ApplyError, BlockNumber, Hash, LedgerConfig, Proposal};
use std::collections::BTreeMap;

/// Ledger owned by one simulated node.
///
/// Outlives crashes of its node: a restarted node sees what was already
/// applied, the way a real ledger database would.
#[derive(Debug, Clone)]
pub struct SimExecutor {
    config: LedgerConfig,
    results: BTreeMap<BlockNumber, Hash>,
    /// Remaining applications that fail with `ApplyError::Unavailable`.
    failures: u32,
    /// Remaining configuration fetches that fail.
    config_failures: u32,
    /// Mixed into every result hash to model a node whose state diverged.
    salt: Option<Vec<u8>>,
}

impl SimExecutor {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            results: BTreeMap::new(),
            failures: 0,
            config_failures: 0,
            salt: None,
        }
    }

    /// Apply `proposal` on top of the current ledger.
    ///
    /// Re-applying an index returns the recorded outcome. Skipping an index
    /// is an execution error.
    pub fn apply(&mut self, proposal: &Proposal) -> Result<ApplicationOutcome, ApplyError> {
        if let Some(result_hash) = self.results.get(&proposal.index) {
            return Ok(ApplicationOutcome {
                index: proposal.index,
                result_hash: *result_hash,
            });
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ApplyError::Unavailable(format!(
                "injected failure at index {}",
                proposal.index.0
            )));
        }
        let expected = self.applied_index().next();
        if proposal.index != expected {
            return Err(ApplyError::Execution(format!(
                "expected index {}, got {}",
                expected.0, proposal.index.0
            )));
        }

        let previous = self
            .results
            .values()
            .next_back()
            .copied()
            .unwrap_or(Hash::ZERO);
        let salt = self.salt.as_deref().unwrap_or_default();
        let result_hash = Hash::from_parts(&[
            previous.as_bytes(),
            proposal.hash.as_bytes(),
            &proposal.payload,
            salt,
        ]);
        self.results.insert(proposal.index, result_hash);

        Ok(ApplicationOutcome {
            index: proposal.index,
            result_hash,
        })
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        self.config.clone()
    }

    /// Answer a configuration poll from the state machine.
    pub fn fetch_ledger_config(&mut self) -> Result<LedgerConfig, ApplyError> {
        if self.config_failures > 0 {
            self.config_failures -= 1;
            return Err(ApplyError::Unavailable("configuration store offline".into()));
        }
        Ok(self.config.clone())
    }

    /// Configuration returned from the next fetch onward.
    pub fn set_ledger_config(&mut self, config: LedgerConfig) {
        self.config = config;
    }

    /// Fail the next `count` applications.
    pub fn fail_next(&mut self, count: u32) {
        self.failures = count;
    }

    /// Fail the next `count` configuration fetches.
    pub fn fail_config_fetches(&mut self, count: u32) {
        self.config_failures = count;
    }

    /// Make every future result hash differ from honest nodes.
    pub fn diverge(&mut self, salt: &[u8]) {
        self.salt = Some(salt.to_vec());
    }

    pub fn applied_index(&self) -> BlockNumber {
        self.results
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BlockNumber::GENESIS)
    }

    pub fn result_hash(&self, index: BlockNumber) -> Option<Hash> {
        self.results.get(&index).copied()
    }
}
