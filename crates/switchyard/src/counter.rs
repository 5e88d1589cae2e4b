use std::sync::Arc;

use tokio::sync::watch;

/// A saturating non-negative counter with an "await zero" primitive.
///
/// Schedulers count live tasks with it, gates count outstanding tokens, and
/// correlators count pending requests; `wait_zero` is the drain primitive all
/// three build on. A waiter registered while the value is non-zero resolves
/// no later than the first time the value reaches zero afterwards.
#[derive(Clone)]
pub struct Counter {
    value: Arc<watch::Sender<u64>>,
}

impl Counter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            value: Arc::new(tx),
        }
    }

    pub fn increment(&self, n: u64) {
        self.value.send_modify(|value| *value = value.saturating_add(n));
    }

    /// Decrements, saturating at zero.
    pub fn decrement(&self, n: u64) {
        self.value.send_modify(|value| *value = value.saturating_sub(n));
    }

    pub fn value(&self) -> u64 {
        *self.value.borrow()
    }

    /// Resolves once the counter reads zero, immediately if it already does.
    pub async fn wait_zero(&self) {
        let mut rx = self.value.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.value()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_zero_resolves_immediately_at_zero() {
        let counter = Counter::new();
        counter.wait_zero().await;
    }

    #[tokio::test]
    async fn decrement_saturates() {
        let counter = Counter::new();
        counter.increment(2);
        counter.decrement(5);
        assert_eq!(counter.value(), 0);
    }

    #[tokio::test]
    async fn waiter_wakes_on_first_zero() {
        let counter = Counter::new();
        counter.increment(2);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_zero().await })
        };

        counter.decrement(1);
        assert!(!waiter.is_finished());
        counter.decrement(1);
        waiter.await.expect("waiter should resolve");
    }
}
