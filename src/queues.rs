//! Ordered set of per-attempt wait queues.
//!
//! Attempt index `i` (0-based) maps to the `i`-th configured queue. The set is built once at
//! startup and never changes; an index past the end means the cascade is exhausted.

use thiserror::Error;

/// Errors produced by [`RetryQueueSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueSetError {
    #[error("attempt {attempt} is out of range for {len} retry queues")]
    OutOfRange { attempt: u32, len: usize },
    #[error("at least one retry queue is required")]
    Empty,
    #[error("retry queue name must not be empty")]
    BlankName,
    #[error("retry queue `{0}` is listed more than once")]
    Duplicate(String),
}

/// Maps attempt indexes to wait-queue names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQueueSet {
    queues: Vec<String>,
}

impl RetryQueueSet {
    /// Build from an ordered list of queue names.
    ///
    /// Rejects an empty list, blank names and duplicates: two attempts sharing a queue would
    /// share its dead-letter behaviour and make the cascade ambiguous.
    pub fn new<I, S>(names: I) -> Result<Self, QueueSetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queues: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if name.is_empty() {
                return Err(QueueSetError::BlankName);
            }
            if queues.contains(&name) {
                return Err(QueueSetError::Duplicate(name));
            }
            queues.push(name);
        }
        if queues.is_empty() {
            return Err(QueueSetError::Empty);
        }
        Ok(Self { queues })
    }

    /// Queue holding a message during the backoff of `attempt`.
    ///
    /// Callers check exhaustion first; an out-of-range index is an error, never a panic.
    pub fn queue_for(&self, attempt: u32) -> Result<&str, QueueSetError> {
        usize::try_from(attempt)
            .ok()
            .and_then(|idx| self.queues.get(idx))
            .map(String::as_str)
            .ok_or(QueueSetError::OutOfRange { attempt, len: self.queues.len() })
    }

    /// Number of wait queues; equals the schedule's `max_attempts`.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> RetryQueueSet {
        RetryQueueSet::new(["retry-queue-1", "retry-queue-2", "retry-queue-3"]).unwrap()
    }

    #[test]
    fn maps_attempts_in_order() {
        let queues = reference();
        assert_eq!(queues.queue_for(0).unwrap(), "retry-queue-1");
        assert_eq!(queues.queue_for(1).unwrap(), "retry-queue-2");
        assert_eq!(queues.queue_for(2).unwrap(), "retry-queue-3");
        assert_eq!(queues.len(), 3);
        assert!(!queues.is_empty());
    }

    #[test]
    fn out_of_range_is_an_error() {
        let queues = reference();
        assert_eq!(queues.queue_for(3), Err(QueueSetError::OutOfRange { attempt: 3, len: 3 }));
        assert!(queues.queue_for(u32::MAX).is_err());
    }

    #[test]
    fn rejects_empty_blank_and_duplicates() {
        assert_eq!(RetryQueueSet::new(Vec::<String>::new()), Err(QueueSetError::Empty));
        assert_eq!(RetryQueueSet::new(["a", ""]), Err(QueueSetError::BlankName));
        assert_eq!(
            RetryQueueSet::new(["a", "b", "a"]),
            Err(QueueSetError::Duplicate("a".to_string()))
        );
    }

    #[test]
    fn iter_preserves_order() {
        let queues = reference();
        let names: Vec<&str> = queues.iter().collect();
        assert_eq!(names, ["retry-queue-1", "retry-queue-2", "retry-queue-3"]);
    }
}
