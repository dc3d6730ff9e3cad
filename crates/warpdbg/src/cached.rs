//! Fetch-once cells for the state cache.

/// A lazily filled value that stays trusted until invalidated.
///
/// The cell remembers the session clock at which it was filled, so callers
/// can tell whether a value was observed during the current stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    value: Option<T>,
    epoch: u64,
}

impl<T> Cached<T> {
    pub const fn new() -> Self {
        Self { value: None, epoch: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Clock value recorded when the cell was last filled.
    pub fn epoch(&self) -> Option<u64> {
        self.value.as_ref().map(|_| self.epoch)
    }

    pub fn set(&mut self, value: T, epoch: u64) {
        self.value = Some(value);
        self.epoch = epoch;
    }

    /// Fill the cell only if it is not already valid.
    pub fn set_if_empty(&mut self, value: T, epoch: u64) {
        if self.value.is_none() {
            self.set(value, epoch);
        }
    }

    pub fn invalidate(&mut self) {
        self.value = None;
    }

    /// Return the cached value, calling `fetch` only when the cell is empty.
    pub fn get_or_try_fill<E>(
        &mut self,
        epoch: u64,
        fetch: impl FnOnce() -> Result<T, E>,
    ) -> Result<&T, E> {
        match self.value {
            Some(ref v) => Ok(v),
            None => {
                let v = fetch()?;
                self.epoch = epoch;
                Ok(self.value.insert(v))
            }
        }
    }
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_fetch_once_per_epoch() {
        let calls = Cell::new(0);
        let mut cell: Cached<u32> = Cached::new();
        let fetch = || -> Result<u32, ()> {
            calls.set(calls.get() + 1);
            Ok(7)
        };
        assert_eq!(*cell.get_or_try_fill(3, fetch).unwrap(), 7);
        assert_eq!(*cell.get_or_try_fill(3, fetch).unwrap(), 7);
        assert_eq!(calls.get(), 1);
        assert_eq!(cell.epoch(), Some(3));

        cell.invalidate();
        assert!(!cell.is_valid());
        assert_eq!(cell.epoch(), None);
        assert_eq!(*cell.get_or_try_fill(4, fetch).unwrap(), 7);
        assert_eq!(calls.get(), 2);
        assert_eq!(cell.epoch(), Some(4));
    }

    #[test]
    fn test_failed_fetch_leaves_cell_empty() {
        let mut cell: Cached<u32> = Cached::new();
        let res = cell.get_or_try_fill(0, || Err("transport down"));
        assert_eq!(res, Err("transport down"));
        assert!(!cell.is_valid());
    }

    #[test]
    fn test_set_if_empty_keeps_first_value() {
        let mut cell = Cached::new();
        cell.set_if_empty(1u64, 10);
        cell.set_if_empty(2u64, 11);
        assert_eq!(cell.get(), Some(&1));
        assert_eq!(cell.epoch(), Some(10));
    }
}
