//! Single-assignment result slot

use thiserror::Error;
use tokio::sync::watch;

/// A second assignment was attempted on a [`ResultSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("result slot already set")]
pub struct AlreadySet;

/// Future-like cell that is assigned exactly once and can be awaited by any
/// number of readers.
#[derive(Debug)]
pub struct ResultSlot<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> ResultSlot<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Assign the slot. Fails if it was already assigned; the first value
    /// is kept.
    pub fn set(&self, value: T) -> Result<(), AlreadySet> {
        let mut value = Some(value);
        let assigned = self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = value.take();
                true
            }
        });
        if assigned {
            Ok(())
        } else {
            Err(AlreadySet)
        }
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the slot is assigned and return a copy of its value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        if let Ok(current) = rx.wait_for(Option::is_some).await {
            if let Some(value) = current.as_ref() {
                return value.clone();
            }
        }
        // The sender lives in `self`, so the channel cannot close while we
        // are borrowed.
        std::future::pending().await
    }
}

impl<V: Clone, E: Clone> ResultSlot<Result<V, E>> {
    pub fn set_value(&self, value: V) -> Result<(), AlreadySet> {
        self.set(Ok(value))
    }

    pub fn set_error(&self, error: E) -> Result<(), AlreadySet> {
        self.set(Err(error))
    }
}

impl<T: Clone> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_once() {
        let slot: ResultSlot<Result<u32, String>> = ResultSlot::new();
        assert!(!slot.is_set());
        slot.set_value(1).unwrap();
        assert_eq!(slot.set_error("late".to_string()), Err(AlreadySet));
        assert_eq!(slot.get(), Some(Ok(1)));
        assert_eq!(slot.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_wait_blocks_until_set() {
        let slot = Arc::new(ResultSlot::<&'static str>::new());
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let slot = slot.clone();
                tokio::spawn(async move { slot.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        for reader in &readers {
            assert!(!reader.is_finished());
        }

        slot.set("done").unwrap();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), "done");
        }
    }
}
