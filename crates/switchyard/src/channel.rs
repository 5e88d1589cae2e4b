use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::CoreError;

type DropHook<T> = Box<dyn Fn(T) + Send + Sync>;

struct State<T> {
    queue: VecDeque<T>,
    aborted: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    max: Option<usize>,
    on_drop: Option<DropHook<T>>,
}

/// A single-consumer FIFO with an optional drop-oldest capacity.
///
/// At most one task may wait in [`Channel::next`] at a time; the wakeup path
/// relies on [`Notify`]'s single stored permit. Once aborted, `push` refuses
/// new values and a pending `next` fails with [`CoreError::ChannelAborted`]
/// until [`Channel::reset`] clears the flag. The gate's wait queue of
/// pending acquirers is one of these, consumed through [`Channel::try_next`]
/// on the release path.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self::with_parts(None, None)
    }

    /// A channel that holds at most `max` values; pushing into a full channel
    /// evicts the oldest value through the drop hook, if one is set.
    pub fn bounded(max: usize) -> Self {
        Self::with_parts(Some(max), None)
    }

    pub fn bounded_with(max: usize, on_drop: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::with_parts(Some(max), Some(Box::new(on_drop)))
    }

    fn with_parts(max: Option<usize>, on_drop: Option<DropHook<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    aborted: false,
                }),
                notify: Notify::new(),
                max,
                on_drop,
            }),
        }
    }

    /// Enqueues a value, returning whether it was accepted. Dropped (and
    /// `false`) once the channel is aborted.
    pub fn push(&self, value: T) -> bool {
        let evicted = {
            let mut state = self.shared.state.lock();
            if state.aborted {
                return false;
            }
            let mut evicted = None;
            if let Some(max) = self.shared.max {
                if state.queue.len() >= max {
                    evicted = state.queue.pop_front();
                }
            }
            state.queue.push_back(value);
            evicted
        };
        if let (Some(value), Some(hook)) = (evicted, self.shared.on_drop.as_ref()) {
            hook(value);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Takes the oldest value, waiting while the channel is empty.
    pub async fn next(&self) -> Result<T, CoreError> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if state.aborted {
                    return Err(CoreError::ChannelAborted);
                }
                if let Some(value) = state.queue.pop_front() {
                    return Ok(value);
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Takes the oldest value if one is queued, without waiting.
    pub fn try_next(&self) -> Option<T> {
        self.shared.state.lock().queue.pop_front()
    }

    /// Removes and returns a specific still-queued value.
    pub fn cancel(&self, value: &T) -> Option<T>
    where
        T: PartialEq,
    {
        let mut state = self.shared.state.lock();
        let position = state.queue.iter().position(|queued| queued == value)?;
        state.queue.remove(position)
    }

    /// Marks the channel aborted and fails the pending `next`, if any.
    pub fn abort(&self) {
        self.shared.state.lock().aborted = true;
        self.shared.notify.notify_one();
    }

    /// Clears the aborted flag; queued values survive an abort/reset cycle.
    pub fn reset(&self) {
        self.shared.state.lock().aborted = false;
    }

    pub fn clear(&self) {
        self.shared.state.lock().queue.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
