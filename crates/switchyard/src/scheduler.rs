//! Hierarchical cooperative task execution with abort propagation.
//!
//! A [`Scheduler`] is a node in a forest. Aborting a node records a
//! [`Reason`], wakes every in-flight [`Scheduler::race`] wait in the subtree
//! without waiting for the underlying futures, and fans out to attached
//! descendants before `abort` returns. Reads of [`Scheduler::reason`] flow
//! through the parent link, so a child with no local reason still reports
//! aborted while an ancestor does.
//!
//! Tasks are ordinary futures that hold a `Scheduler` handle and observe
//! cancellation through its awaits:
//! - [`Scheduler::run`] awaits the future fully and surfaces the abort at the
//!   next suspension point;
//! - [`Scheduler::race`] resolves as soon as the node aborts, dropping the
//!   pending future;
//! - [`Scheduler::checkpoint`] is the explicit mid-computation abort probe.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::counter::Counter;
use crate::error::{CoreError, Reason};

struct NodeState {
    reason: Option<Reason>,
    destroyed: bool,
    children: Vec<Weak<Node>>,
}

struct Node {
    parent: Option<Arc<Node>>,
    state: Mutex<NodeState>,
    /// Bumped on every abort that reaches this node; race waits subscribe to
    /// it so cancellation does not wait for their underlying futures.
    epoch: watch::Sender<u64>,
    running: Counter,
}

impl Node {
    fn new(parent: Option<Arc<Node>>) -> Arc<Self> {
        let (epoch, _) = watch::channel(0);
        let node = Arc::new(Node {
            parent,
            state: Mutex::new(NodeState {
                reason: None,
                destroyed: false,
                children: Vec::new(),
            }),
            epoch,
            running: Counter::new(),
        });
        if let Some(parent) = &node.parent {
            parent.state.lock().children.push(Arc::downgrade(&node));
        }
        node
    }

    fn reason(&self) -> Option<Reason> {
        if let Some(reason) = self.state.lock().reason.clone() {
            return Some(reason);
        }
        let mut current = self.parent.clone();
        while let Some(node) = current {
            if let Some(reason) = node.state.lock().reason.clone() {
                return Some(reason);
            }
            current = node.parent.clone();
        }
        None
    }

    /// Wakes race waits on this node and every attached descendant.
    fn broadcast_abort(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        let children: Vec<Arc<Node>> = {
            let mut state = self.state.lock();
            state.children.retain(|child| child.strong_count() > 0);
            state.children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.broadcast_abort();
        }
    }

    fn ancestor_chain(self: &Arc<Self>) -> Vec<Arc<Node>> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent.clone();
        while let Some(node) = current {
            current = node.parent.clone();
            chain.push(node);
        }
        chain
    }
}

/// Decrements the live-task counters captured at task start, even when the
/// task future is dropped mid-flight.
struct RunningGuard {
    chain: Vec<Arc<Node>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        for node in &self.chain {
            node.running.decrement(1);
        }
    }
}

/// A cooperative task-execution context forming part of an abort-propagating
/// tree. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Scheduler {
    node: Arc<Node>,
}

impl Scheduler {
    /// Creates a root node.
    pub fn new() -> Self {
        Self {
            node: Node::new(None),
        }
    }

    /// Creates a child subscribed to this node's abort broadcast.
    pub fn child(&self) -> Scheduler {
        Scheduler {
            node: Node::new(Some(self.node.clone())),
        }
    }

    /// The effective abort reason: the local value if set, else the nearest
    /// ancestor's.
    pub fn reason(&self) -> Option<Reason> {
        self.node.reason()
    }

    pub fn aborted(&self) -> bool {
        self.reason().is_some()
    }

    pub fn destroyed(&self) -> bool {
        self.node.state.lock().destroyed
    }

    /// Live tasks in this subtree (descendants increment their ancestors).
    pub fn running_tasks(&self) -> u64 {
        self.node.running.value()
    }

    /// Sets the local reason, wakes every in-flight race wait in the subtree,
    /// and signals attached descendants, all before returning.
    pub fn abort(&self, reason: Reason) {
        self.node.state.lock().reason = Some(reason);
        self.node.broadcast_abort();
    }

    /// Clears the local reason. Ancestor reasons are untouched, so the node
    /// may still report `aborted`.
    pub fn resume(&self) {
        self.node.state.lock().reason = None;
    }

    /// Detaches the node from its parent's abort broadcast. Existing tasks
    /// continue; new tasks are refused until [`Scheduler::recover`].
    pub fn destroy(&self) {
        self.node.state.lock().destroyed = true;
        if let Some(parent) = &self.node.parent {
            let own = Arc::as_ptr(&self.node);
            parent.state.lock().children.retain(|child| child.as_ptr() != own);
        }
    }

    /// Reattaches to the parent's abort broadcast; idempotent.
    pub fn recover(&self) {
        if let Some(parent) = &self.node.parent {
            let own = Arc::as_ptr(&self.node);
            let mut state = parent.state.lock();
            if !state.children.iter().any(|child| child.as_ptr() == own) {
                state.children.push(Arc::downgrade(&self.node));
            }
        }
        self.node.state.lock().destroyed = false;
    }

    /// Runs a task to completion, counting it live on this node and every
    /// ancestor for the duration. Refused on a destroyed node.
    pub async fn execute<F: std::future::Future>(&self, task: F) -> Result<F::Output, CoreError> {
        if self.node.state.lock().destroyed {
            return Err(CoreError::SchedulerDestroyed);
        }
        let chain = self.node.ancestor_chain();
        for node in &chain {
            node.running.increment(1);
        }
        let guard = RunningGuard { chain };
        let output = task.await;
        drop(guard);
        Ok(output)
    }

    /// Awaits the future fully, then surfaces the abort at this suspension
    /// point: the value is discarded when the node is aborted.
    pub async fn run<F: std::future::Future>(&self, fut: F) -> Result<F::Output, CoreError> {
        let value = fut.await;
        match self.reason() {
            Some(reason) => Err(CoreError::Aborted(reason)),
            None => Ok(value),
        }
    }

    /// Races the future against this node's abort signal. An abort wins while
    /// the future is still pending; the losing future is dropped.
    pub async fn race<F: std::future::Future>(&self, fut: F) -> Result<F::Output, CoreError> {
        let mut epoch = self.node.epoch.subscribe();
        if let Some(reason) = self.reason() {
            return Err(CoreError::Aborted(reason));
        }
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                changed = epoch.changed() => {
                    let _ = changed;
                    if let Some(reason) = self.reason() {
                        return Err(CoreError::Aborted(reason));
                    }
                }
                value = &mut fut => {
                    return match self.reason() {
                        Some(reason) => Err(CoreError::Aborted(reason)),
                        None => Ok(value),
                    };
                }
            }
        }
    }

    /// Explicit abort probe between long synchronous stretches.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        match self.reason() {
            Some(reason) => Err(CoreError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolves when this node's live-task counter reaches zero.
    pub async fn wait_drain(&self) {
        self.node.running.wait_zero().await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("aborted", &self.aborted())
            .field("destroyed", &self.destroyed())
            .field("running_tasks", &self.running_tasks())
            .finish()
    }
}
