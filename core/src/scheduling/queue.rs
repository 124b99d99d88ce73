// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! FIFO task queue with a dispatch wake signal.
//!
//! The dispatcher sleeps on the signal and drains on each wake; producers
//! (new tasks, requeues, capacity changes) re-arm it. A task whose slot
//! requirement fits no worker simply stays queued — the dispatcher never
//! spins on it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::scheduling::registry::{WorkerId, WorkerRegistry};
use crate::scheduling::task::TaskSpec;

/// A queued task plus its dispatch metadata
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// The immutable task descriptor
    pub spec: TaskSpec,
    /// Auth rejections already seen while dispatching this task
    pub auth_failures: u32,
}

/// FIFO queue of pending tasks
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<QueuedTask>>,
    signal: Notify,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh task and wake the dispatcher.
    pub fn enqueue(&self, spec: TaskSpec) {
        self.inner.lock().push_back(QueuedTask {
            spec,
            auth_failures: 0,
        });
        self.signal.notify_one();
    }

    /// Append a previously dispatched task at the tail (never the head, so a
    /// poison task cannot block all progress).
    ///
    /// Deliberately does not wake the dispatcher: a failed dispatch did not
    /// create capacity, and retrying is driven by the next heartbeat or slot
    /// update instead of a tight loop against an unreachable worker.
    pub fn requeue(&self, task: QueuedTask) {
        self.inner.lock().push_back(task);
    }

    /// Requeue a batch of orphaned task specs.
    pub fn requeue_specs(&self, specs: Vec<TaskSpec>) {
        if specs.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for spec in specs {
            inner.push_back(QueuedTask {
                spec,
                auth_failures: 0,
            });
        }
        drop(inner);
        self.signal.notify_one();
    }

    /// Wake the dispatcher without enqueueing (capacity became available).
    pub fn wake(&self) {
        self.signal.notify_one();
    }

    /// Wait until the queue is woken.
    pub async fn wait(&self) {
        self.signal.notified().await;
    }

    /// Pop the first task that fits on a live worker.
    ///
    /// The candidate's cached slots are decremented and the task recorded
    /// in-flight under the same queue lock, so concurrent producers observe
    /// a consistent FIFO order and no worker is double-booked.
    pub fn pop_dispatchable(&self, registry: &WorkerRegistry) -> Option<(QueuedTask, WorkerId)> {
        let mut inner = self.inner.lock();
        for index in 0..inner.len() {
            if let Some(worker) = registry.reserve(&inner[index].spec) {
                let task = inner.remove(index).expect("index in bounds");
                return Some((task, worker));
            }
        }
        None
    }

    /// Drop every queued task belonging to `match_id`; returns the count.
    pub fn cancel_match(&self, match_id: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|task| task.spec.match_id() != Some(match_id));
        before - inner.len()
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::WorkerInfo;
    use crate::scheduling::task::{CompileTask, PlayerTask};
    use chrono::Utc;

    fn compile_task(champion_id: u64) -> TaskSpec {
        TaskSpec::Compile(CompileTask {
            champion_id,
            user: "alice".into(),
        })
    }

    fn player_task(match_id: u64, match_player_id: u64) -> TaskSpec {
        TaskSpec::Player(PlayerTask {
            match_id,
            match_player_id,
            champion_id: 7,
            user: "alice".into(),
            server_host: "w1".into(),
            req_port: 20000,
            sub_port: 20001,
            options: Default::default(),
        })
    }

    fn registry_with_worker(current: u32, max: u32) -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        registry.on_heartbeat(
            &WorkerInfo {
                hostname: "w1".into(),
                port: 21100,
                current_slots: current,
                max_slots: max,
            },
            true,
            Utc::now(),
        );
        registry
    }

    #[test]
    fn test_fifo_among_dispatchable() {
        let queue = TaskQueue::new();
        let registry = registry_with_worker(4, 4);

        queue.enqueue(compile_task(1));
        queue.enqueue(compile_task(2));

        let (first, _) = queue.pop_dispatchable(&registry).unwrap();
        let (second, _) = queue.pop_dispatchable(&registry).unwrap();
        assert_eq!(first.spec.id().to_string(), "compile-1");
        assert_eq!(second.spec.id().to_string(), "compile-2");
    }

    #[test]
    fn test_undispatchable_head_does_not_block_tail() {
        let queue = TaskQueue::new();
        let registry = registry_with_worker(1, 1);

        // Head needs 2 slots, tail needs 1
        queue.enqueue(player_task(42, 1));
        queue.enqueue(compile_task(7));

        let (popped, _) = queue.pop_dispatchable(&registry).unwrap();
        assert_eq!(popped.spec.id().to_string(), "compile-7");
        assert_eq!(queue.len(), 1);

        // The oversized task never dispatches but also never spins
        assert!(queue.pop_dispatchable(&registry).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_oversubscription_waits_for_capacity() {
        let queue = TaskQueue::new();
        let registry = registry_with_worker(2, 2);

        queue.enqueue(player_task(42, 1));
        queue.enqueue(player_task(42, 2));

        assert!(queue.pop_dispatchable(&registry).is_some());
        // Second 2-slot task must wait for the first to finish
        assert!(queue.pop_dispatchable(&registry).is_none());

        // Worker reports its slots back
        registry.on_worker_update(&WorkerInfo {
            hostname: "w1".into(),
            port: 21100,
            current_slots: 2,
            max_slots: 2,
        });
        let (popped, _) = queue.pop_dispatchable(&registry).unwrap();
        assert_eq!(popped.spec.id().to_string(), "player-42-2");
    }

    #[test]
    fn test_cancel_match_removes_its_tasks() {
        let queue = TaskQueue::new();
        queue.enqueue(player_task(42, 1));
        queue.enqueue(player_task(42, 2));
        queue.enqueue(compile_task(7));
        queue.enqueue(player_task(43, 1));

        assert_eq!(queue.cancel_match(42), 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_wake_signal_is_not_lost() {
        let queue = TaskQueue::new();
        // Notification sent before anyone waits must still be observed
        queue.wake();
        tokio::time::timeout(std::time::Duration::from_millis(100), queue.wait())
            .await
            .expect("wake should have been buffered");
    }
}
