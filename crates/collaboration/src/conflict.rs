/// Operation history and rebasing for one document
use std::collections::HashMap;

use crate::{CollaborationError, Operation, Result, UserId};

/// Owns the totally ordered, append-only history of a single document.
///
/// Every incoming operation is rebased against the history before it is
/// appended. The resolver never touches document text; applying the rebased
/// operation is the caller's job.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    /// Accepted operations, already rebased, in admission order
    history: Vec<Operation>,

    /// Incremented once per accepted operation
    version: u64,

    /// Operations accepted per actor, kept for audit and undo
    pending: HashMap<UserId, Vec<Operation>>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebase `operation` against the whole history and append it
    pub fn add_operation(&mut self, actor: &UserId, operation: Operation) -> Result<Operation> {
        self.add_operation_since(actor, operation, 0)
    }

    /// Rebase `operation` against the operations accepted after
    /// `known_version` and append it
    pub fn add_operation_since(
        &mut self,
        actor: &UserId,
        operation: Operation,
        known_version: u64,
    ) -> Result<Operation> {
        let rebased = self.rebase(&operation, known_version)?;
        self.record(actor, rebased.clone());
        Ok(rebased)
    }

    /// Compute the rebased form of `operation` without recording it
    pub fn rebase(&self, operation: &Operation, known_version: u64) -> Result<Operation> {
        operation.rebase(self.operations_since(known_version)?)
    }

    /// Append an operation that has already been rebased
    pub fn record(&mut self, actor: &UserId, rebased: Operation) {
        self.history.push(rebased.clone());
        self.version += 1;
        self.pending.entry(actor.clone()).or_default().push(rebased);
    }

    /// Operations accepted after `version`
    pub fn operations_since(&self, version: u64) -> Result<&[Operation]> {
        if version > self.version {
            return Err(CollaborationError::UnknownVersion {
                requested: version,
                current: self.version,
            });
        }
        Ok(&self.history[version as usize..])
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Operations accepted from `actor`, in order
    pub fn pending_for(&self, actor: &UserId) -> &[Operation] {
        self.pending.get(actor).map(Vec::as_slice).unwrap_or(&[])
    }
}
