//! Bounded concurrency gate: a fixed token pool with a bounded FIFO wait
//! queue.
//!
//! `tokens outstanding + tokens idle == max_tokens` at every observable
//! point, and the wait queue never exceeds `max_queued`; an acquire past both
//! limits fails synchronously. A released token is handed straight to the
//! queue head instead of returning to the idle pool. The queue itself is a
//! [`Channel`] of pending acquirers, removed either by the release path
//! ([`Channel::try_next`]) or by [`Gate::cancel`].

use std::{sync::Arc, sync::Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::counter::Counter;
use crate::error::{CoreError, Reason};

/// Gate sizing, deserializable so transport configs can carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GateConfig {
    pub max_tokens: usize,
    pub max_queued: usize,
}

impl GateConfig {
    pub fn build(&self) -> Gate {
        Gate::new(self.max_tokens, self.max_queued)
    }
}

/// Where a token is in its lifecycle:
/// *idle* (pooled) → *stopped* (held) → *working* (inside [`Token::work`]) →
/// *stopped* → *idle* (released).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Idle,
    Working,
    Stopped,
}

/// A concurrency token held out of the gate's pool.
///
/// Dropping a token without [`Gate::release`] returns it to the gate, so a
/// token stranded in an abandoned acquire future cannot shrink the pool.
#[derive(Debug)]
pub struct Token {
    id: usize,
    status: TokenStatus,
    gate: Weak<GateShared>,
    spent: bool,
}

impl Token {
    pub fn status(&self) -> TokenStatus {
        self.status
    }

    /// Runs a future while this token is marked *working*. Erring on a token
    /// that is not *stopped* catches double use.
    pub async fn work<F: std::future::Future>(&mut self, fut: F) -> Result<F::Output, CoreError> {
        if self.status != TokenStatus::Stopped {
            return Err(CoreError::TokenMisuse);
        }
        self.status = TokenStatus::Working;
        let output = fut.await;
        self.status = TokenStatus::Stopped;
        Ok(output)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if !self.spent {
            if let Some(gate) = self.gate.upgrade() {
                GateShared::restore(&gate, self.id);
            }
        }
    }
}

/// Handle to a queued acquire, used to remove it before it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireHandle {
    id: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Token, Reason>>,
}

/// Waiters are looked up in the queue by their acquire id.
impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

struct GateState {
    idle: Vec<usize>,
    next_waiter: u64,
}

struct GateShared {
    state: Mutex<GateState>,
    /// The bounded FIFO of pending acquirers. Pushes and pops happen under
    /// the `state` lock so the idle pool and the queue stay coherent; cancel
    /// relies on the channel's own removal instead.
    waiters: Channel<Waiter>,
    max_tokens: usize,
    max_queued: usize,
    outstanding: Counter,
}

impl GateShared {
    /// Returns a token to the gate: resolve the queue head with it, or put it
    /// back in the idle pool.
    fn restore(shared: &Arc<GateShared>, id: usize) {
        let mut state = shared.state.lock();
        loop {
            match shared.waiters.try_next() {
                Some(waiter) => {
                    let token = Token {
                        id,
                        status: TokenStatus::Stopped,
                        gate: Arc::downgrade(shared),
                        spent: false,
                    };
                    match waiter.tx.send(Ok(token)) {
                        Ok(()) => return,
                        // Receiver gone; defuse the returned token and try the
                        // next waiter without re-entering Drop under the lock.
                        Err(Ok(mut token)) => {
                            token.spent = true;
                            continue;
                        }
                        Err(Err(_)) => unreachable!("restore only sends Ok"),
                    }
                }
                None => {
                    state.idle.push(id);
                    shared.outstanding.decrement(1);
                    return;
                }
            }
        }
    }
}

/// The result of a synchronous acquire decision: either a ready token or a
/// queued wait with a cancellation handle.
pub struct PendingToken {
    inner: PendingInner,
    handle: Option<AcquireHandle>,
}

enum PendingInner {
    Ready(Token),
    Queued(oneshot::Receiver<Result<Token, Reason>>),
}

impl PendingToken {
    /// `Some` only when the acquire was queued.
    pub fn handle(&self) -> Option<AcquireHandle> {
        self.handle
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner, PendingInner::Ready(_))
    }

    pub async fn token(self) -> Result<Token, CoreError> {
        match self.inner {
            PendingInner::Ready(token) => Ok(token),
            PendingInner::Queued(rx) => match rx.await {
                Ok(Ok(token)) => Ok(token),
                Ok(Err(reason)) => Err(CoreError::Aborted(reason)),
                Err(_) => Err(CoreError::ChannelClosed),
            },
        }
    }
}

/// A fixed-size token pool with a bounded wait queue, used to cap concurrent
/// handler executions.
#[derive(Clone)]
pub struct Gate {
    shared: Arc<GateShared>,
}

impl Gate {
    pub fn new(max_tokens: usize, max_queued: usize) -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    idle: (0..max_tokens).collect(),
                    next_waiter: 0,
                }),
                waiters: Channel::new(),
                max_tokens,
                max_queued,
                outstanding: Counter::new(),
            }),
        }
    }

    /// Synchronously resolves with an idle token, queues when the pool is
    /// exhausted, or fails with [`CoreError::TooManyQueued`] when the queue
    /// is full as well.
    pub fn acquire(&self) -> Result<PendingToken, CoreError> {
        let mut state = self.shared.state.lock();
        if let Some(id) = state.idle.pop() {
            self.shared.outstanding.increment(1);
            return Ok(PendingToken {
                inner: PendingInner::Ready(Token {
                    id,
                    status: TokenStatus::Stopped,
                    gate: Arc::downgrade(&self.shared),
                    spent: false,
                }),
                handle: None,
            });
        }
        if self.shared.waiters.len() >= self.shared.max_queued {
            return Err(CoreError::TooManyQueued);
        }
        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter;
        state.next_waiter += 1;
        self.shared.waiters.push(Waiter { id, tx });
        Ok(PendingToken {
            inner: PendingInner::Queued(rx),
            handle: Some(AcquireHandle { id }),
        })
    }

    /// Returns a token; the queue head, if any, receives it directly.
    pub fn release(&self, mut token: Token) {
        token.spent = true;
        GateShared::restore(&self.shared, token.id);
    }

    /// Removes a queued acquire and fails its future with `reason`; a no-op
    /// once the acquire has resolved. The channel removal is atomic with the
    /// release path's pop, so the waiter lands in exactly one of *finished*
    /// or *canceled*.
    pub fn cancel(&self, handle: &AcquireHandle, reason: Option<Reason>) -> bool {
        let probe = Waiter {
            id: handle.id,
            tx: oneshot::channel().0,
        };
        match self.shared.waiters.cancel(&probe) {
            Some(waiter) => {
                let reason = reason.unwrap_or_else(|| Reason::new("acquire canceled"));
                let _ = waiter.tx.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Tokens currently held out of the pool.
    pub fn parallels(&self) -> u64 {
        self.shared.outstanding.value()
    }

    pub fn queued(&self) -> usize {
        self.shared.waiters.len()
    }

    /// Remaining queue capacity.
    pub fn available(&self) -> usize {
        self.shared.max_queued - self.queued()
    }

    pub fn max_tokens(&self) -> usize {
        self.shared.max_tokens
    }

    pub fn max_queued(&self) -> usize {
        self.shared.max_queued
    }

    pub fn idle_tokens(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Resolves when every token is back in the idle pool.
    pub async fn wait_drain(&self) {
        self.shared.outstanding.wait_zero().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_token(gate: &Gate) -> Token {
        let pending = gate.acquire().unwrap();
        assert!(pending.is_ready());
        pending.token().await.unwrap()
    }

    #[tokio::test]
    async fn pool_accounting_holds() {
        let gate = Gate::new(2, 1);
        assert_eq!(gate.idle_tokens(), 2);

        let one = ready_token(&gate).await;
        let two = ready_token(&gate).await;
        assert_eq!(gate.parallels(), 2);
        assert_eq!(gate.idle_tokens(), 0);

        gate.release(one);
        assert_eq!(gate.parallels(), 1);
        assert_eq!(gate.idle_tokens(), 1);
        gate.release(two);
        gate.wait_drain().await;
    }

    #[tokio::test]
    async fn overflow_queues_then_fails() {
        let gate = Gate::new(1, 1);
        let held = ready_token(&gate).await;

        let queued = gate.acquire().unwrap();
        assert!(!queued.is_ready());
        assert!(queued.handle().is_some());
        assert_eq!(gate.available(), 0);

        assert!(matches!(gate.acquire(), Err(CoreError::TooManyQueued)));

        gate.release(held);
        let token = queued.token().await.unwrap();
        // Handed straight to the waiter: still outstanding, not idle.
        assert_eq!(gate.parallels(), 1);
        assert_eq!(gate.idle_tokens(), 0);
        gate.release(token);
    }

    #[tokio::test]
    async fn cancel_removes_queued_acquire() {
        let gate = Gate::new(1, 2);
        let held = ready_token(&gate).await;

        let queued = gate.acquire().unwrap();
        let handle = queued.handle().unwrap();
        assert!(gate.cancel(&handle, Some(Reason::new("gone"))));
        assert!(!gate.cancel(&handle, None));

        let result = queued.token().await;
        assert!(matches!(result, Err(CoreError::Aborted(_))));

        // The canceled waiter must not consume the released token.
        gate.release(held);
        assert_eq!(gate.idle_tokens(), 1);
        assert_eq!(gate.parallels(), 0);
    }

    #[tokio::test]
    async fn dropped_pending_acquire_does_not_leak_tokens() {
        let gate = Gate::new(1, 1);
        let held = ready_token(&gate).await;

        let queued = gate.acquire().unwrap();
        drop(queued);

        gate.release(held);
        gate.wait_drain().await;
        assert_eq!(gate.idle_tokens(), 1);
    }

    #[tokio::test]
    async fn work_requires_a_stopped_token() {
        let gate = Gate::new(1, 0);
        let mut token = ready_token(&gate).await;
        assert_eq!(token.status(), TokenStatus::Stopped);

        let out = token.work(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        assert_eq!(token.status(), TokenStatus::Stopped);
        gate.release(token);
    }
}
