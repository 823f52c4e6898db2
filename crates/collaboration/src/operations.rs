/// Text edit operations and the transform rule used to rebase them
/// Positions and lengths are counted in chars, never in bytes
use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result};

/// Types of edits that can be performed on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
}

/// A single edit against a document's character sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,

    /// Offset into the document at the time the edit was issued
    pub position: usize,

    /// Inserted text, or the text being deleted (only its length is used)
    pub content: String,
}

impl Operation {
    pub fn new(kind: OperationKind, position: usize, content: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            content: content.into(),
        }
    }

    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self::new(OperationKind::Insert, position, content)
    }

    pub fn delete(position: usize, content: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, position, content)
    }

    /// Number of characters this operation inserts or removes
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Reject operations that carry no content
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CollaborationError::InvalidOperation(format!(
                "{:?} at {} has empty content",
                self.kind, self.position
            )));
        }
        Ok(())
    }

    /// Rebase this operation over `applied`, which has already been applied
    /// to the document.
    ///
    /// Equal positions count as "`applied` came first". Delete ranges are only
    /// shifted, never narrowed or split.
    pub fn transform(&self, applied: &Operation) -> Result<Operation> {
        if self.position < applied.position {
            return Ok(self.clone());
        }

        let shift = applied.len();
        let position = match applied.kind {
            OperationKind::Insert => self.position + shift,
            OperationKind::Delete => {
                self.position
                    .checked_sub(shift)
                    .ok_or(CollaborationError::PositionUnderflow {
                        position: self.position,
                        shift,
                    })?
            }
        };

        Ok(Operation {
            position,
            ..self.clone()
        })
    }

    /// Fold `transform` over `history` in order
    pub fn rebase<'a, I>(&self, history: I) -> Result<Operation>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        history
            .into_iter()
            .try_fold(self.clone(), |op, applied| op.transform(applied))
    }

    /// Check that this operation fits a document of `document_length` chars
    pub fn check_bounds(&self, document_length: usize) -> Result<()> {
        let fits = match self.kind {
            OperationKind::Insert => self.position <= document_length,
            OperationKind::Delete => self
                .position
                .checked_add(self.len())
                .is_some_and(|end| end <= document_length),
        };

        if fits {
            Ok(())
        } else {
            Err(CollaborationError::OutOfBoundsOperation {
                position: self.position,
                length: self.len(),
                document_length,
            })
        }
    }

    /// Apply this operation to `text` in place.
    ///
    /// The text is left untouched when the operation does not fit.
    pub fn apply_to(&self, text: &mut String) -> Result<()> {
        let document_length = text.chars().count();
        self.check_bounds(document_length)?;

        let start = byte_offset(text, self.position);
        match self.kind {
            OperationKind::Insert => text.insert_str(start, &self.content),
            OperationKind::Delete => {
                let end = byte_offset(text, self.position + self.len());
                text.replace_range(start..end, "");
            }
        }
        Ok(())
    }
}

/// Replay an admitted operation log against an empty document
pub fn replay<'a, I>(operations: I) -> Result<String>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut text = String::new();
    for op in operations {
        op.apply_to(&mut text)?;
    }
    Ok(text)
}

/// Byte offset of the char at `char_index`, or the end of `text`
fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_before_applied_is_unchanged() {
        let op = Operation::insert(2, "ab");
        let applied = Operation::insert(5, "xyz");

        assert_eq!(op.transform(&applied).unwrap(), op);
    }

    #[test]
    fn test_transform_after_insert_shifts_right() {
        let op = Operation::delete(7, "q");
        let applied = Operation::insert(3, "four");

        let rebased = op.transform(&applied).unwrap();
        assert_eq!(rebased.position, 11);
        assert_eq!(rebased.kind, OperationKind::Delete);
        assert_eq!(rebased.content, "q");
    }

    #[test]
    fn test_transform_after_delete_shifts_left() {
        let op = Operation::insert(10, "z");
        let applied = Operation::delete(2, "abc");

        assert_eq!(op.transform(&applied).unwrap().position, 7);
    }

    #[test]
    fn test_transform_equal_positions_treat_applied_as_first() {
        let op = Operation::insert(4, "mine");
        let applied = Operation::insert(4, "theirs");

        assert_eq!(op.transform(&applied).unwrap().position, 10);
    }

    #[test]
    fn test_transform_delete_underflow_is_rejected() {
        let op = Operation::insert(1, "x");
        let applied = Operation::delete(0, "abc");

        let err = op.transform(&applied).unwrap_err();
        assert!(matches!(
            err,
            CollaborationError::PositionUnderflow {
                position: 1,
                shift: 3
            }
        ));
        assert_eq!(
            err.to_string(),
            "rebased position 1 minus 3 falls before the start of the document"
        );
    }

    #[test]
    fn test_rebase_folds_in_order() {
        let history = vec![Operation::insert(0, "Hello"), Operation::delete(0, "He")];
        let op = Operation::insert(0, "!");

        // 0 -> 5 after the insert, then 5 -> 3 after the delete
        assert_eq!(op.rebase(&history).unwrap().position, 3);
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let mut text = String::from("Hello world");

        Operation::insert(5, ",").apply_to(&mut text).unwrap();
        assert_eq!(text, "Hello, world");

        Operation::delete(0, "Hello").apply_to(&mut text).unwrap();
        assert_eq!(text, ", world");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let mut text = String::from("héllo");

        Operation::insert(2, "✓").apply_to(&mut text).unwrap();
        assert_eq!(text, "hé✓llo");

        Operation::delete(1, "é✓").apply_to(&mut text).unwrap();
        assert_eq!(text, "hllo");
    }

    #[test]
    fn test_apply_out_of_bounds_leaves_text_untouched() {
        let mut text = String::from("abc");

        assert!(Operation::insert(4, "x").apply_to(&mut text).is_err());
        assert!(Operation::delete(2, "cd").apply_to(&mut text).is_err());
        assert_eq!(text, "abc");

        // Boundaries themselves are fine
        Operation::insert(3, "d").apply_to(&mut text).unwrap();
        Operation::delete(1, "bcd").apply_to(&mut text).unwrap();
        assert_eq!(text, "a");
    }

    #[test]
    fn test_validate_rejects_empty_content() {
        assert!(Operation::insert(0, "").validate().is_err());
        assert!(Operation::delete(0, "x").validate().is_ok());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let log = vec![
            Operation::insert(0, "collab"),
            Operation::insert(6, " text"),
            Operation::delete(0, "co"),
            Operation::insert(0, "Re"),
        ];

        let first = replay(&log).unwrap();
        for _ in 0..10 {
            assert_eq!(replay(&log).unwrap(), first);
        }
        assert_eq!(first, "Rellab text");
    }

    #[test]
    fn test_operation_json_shape() {
        let op = Operation::insert(3, "hi");
        let json = serde_json::to_value(&op).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "kind": "insert", "position": 3, "content": "hi" })
        );
    }
}
