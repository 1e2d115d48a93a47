//! Fixed-capacity ring buffer that overwrites its oldest entry.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// Append-only log holding at most `CAP` entries.
///
/// Serializes as a plain JSON array, oldest first. Deserializing an array
/// longer than `CAP` keeps its last `CAP` elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BoundedLog<T, const CAP: usize> {
    entries: VecDeque<T>,
}

impl<T, const CAP: usize> BoundedLog<T, CAP> {
    pub const CAPACITY: usize = CAP;

    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Appends an entry, evicting from the front until within capacity.
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        while self.entries.len() > CAP {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.entries.iter_mut()
    }
}

impl<T, const CAP: usize> Default for BoundedLog<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'de, T, const CAP: usize> Deserialize<'de> for BoundedLog<T, CAP>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LogVisitor<T, const CAP: usize>(PhantomData<T>);

        impl<'de, T, const CAP: usize> Visitor<'de> for LogVisitor<T, CAP>
        where
            T: Deserialize<'de>,
        {
            type Value = BoundedLog<T, CAP>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut log = BoundedLog::new();
                while let Some(entry) = seq.next_element()? {
                    log.push(entry);
                }
                Ok(log)
            }
        }

        deserializer.deserialize_seq(LogVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut log: BoundedLog<u32, 3> = BoundedLog::new();
        log.push(1);
        log.push(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last(), Some(&2));
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut log: BoundedLog<u32, 3> = BoundedLog::new();
        for i in 0..10 {
            log.push(i);
            assert!(log.len() <= 3);
        }
        let kept: Vec<u32> = log.iter().copied().collect();
        assert_eq!(kept, vec![7, 8, 9]);
    }

    #[test]
    fn test_serializes_as_array() {
        let mut log: BoundedLog<&str, 2> = BoundedLog::new();
        log.push("a");
        log.push("b");
        log.push("c");
        assert_eq!(serde_json::to_string(&log).unwrap(), r#"["b","c"]"#);
    }

    #[test]
    fn test_oversized_input_is_capped_on_deserialize() {
        let log: BoundedLog<u32, 2> = serde_json::from_str("[1,2,3,4]").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![3, 4]);

        let mut log = log;
        log.push(5);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_deserialize_rejects_non_array() {
        assert!(serde_json::from_str::<BoundedLog<u32, 2>>("{}").is_err());
        let empty: BoundedLog<u32, 2> = serde_json::from_str("[]").unwrap();
        assert!(empty.is_empty());
    }
}
