use crate::error::{ConsensusError, ConsensusResult};
use dbft_primitives::ValidatorIndex;
use ed25519_dalek::VerifyingKey;

/// The ordered validator set for the current epoch.
///
/// Validators are addressed by their position in the list. The set is fixed
/// for an epoch; `f = (n - 1) / 3` Byzantine members are tolerated and the
/// commit quorum is `m = n - f`.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<VerifyingKey>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<VerifyingKey>) -> Self {
        Self { validators }
    }

    pub fn len(&self) -> u16 {
        self.validators.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Number of Byzantine faults tolerated.
    pub fn fault_tolerance(&self) -> usize {
        (self.validators.len().saturating_sub(1)) / 3
    }

    /// Number of matching commits required to finalize a block.
    pub fn quorum(&self) -> usize {
        self.validators.len() - self.fault_tolerance()
    }

    pub fn public_key(&self, index: ValidatorIndex) -> ConsensusResult<&VerifyingKey> {
        self.validators
            .get(index as usize)
            .ok_or(ConsensusError::UnknownValidator {
                index,
                set_size: self.len(),
            })
    }

    pub fn contains(&self, index: ValidatorIndex) -> bool {
        (index as usize) < self.validators.len()
    }

    /// Position of `key` in the set, or `None` for an observer.
    pub fn index_of(&self, key: &VerifyingKey) -> Option<ValidatorIndex> {
        self.validators
            .iter()
            .position(|k| k == key)
            .map(|i| i as ValidatorIndex)
    }

    pub fn indices(&self) -> impl Iterator<Item = ValidatorIndex> + '_ {
        (0..self.len()).map(|i| i as ValidatorIndex)
    }
}
