// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker registry: capacity cache, liveness and in-flight bookkeeping.
//!
//! The registry holds the master's cached projection of every worker's free
//! slots. The cache is decremented by dispatch decisions and overwritten by
//! the worker's own reports (heartbeats and updates); the worker stays the
//! authority on its slot count.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

use crate::rpc::protocol::{WorkerInfo, WorkerSnapshot};
use crate::scheduling::task::{TaskId, TaskSpec};

/// Worker identity: where the master dials back
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    /// Worker hostname
    pub hostname: String,
    /// Worker RPC port
    pub port: u16,
}

impl WorkerId {
    /// Identity carried by a heartbeat
    pub fn from_info(info: &WorkerInfo) -> Self {
        Self {
            hostname: info.hostname.clone(),
            port: info.port,
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// One registered worker
#[derive(Debug)]
struct WorkerEntry {
    /// Advertised capacity
    max_slots: u32,
    /// Cached free slots (dispatch decrements, worker reports overwrite)
    current_slots: u32,
    /// Last heartbeat seen
    last_heartbeat: DateTime<Utc>,
    /// Tasks the master believes are running there
    tasks_in_flight: HashMap<TaskId, TaskSpec>,
    /// An auth rejection was already observed since registration
    auth_suspect: bool,
}

/// Registry of live workers
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a heartbeat, upserting the worker.
    ///
    /// When the worker announces a restart (`first_heartbeat`), reappears
    /// after an eviction, or advertises a different capacity, its in-flight
    /// set is reset and the orphaned tasks are returned for requeueing.
    pub fn on_heartbeat(&self, info: &WorkerInfo, first_heartbeat: bool, now: DateTime<Utc>) -> Vec<TaskSpec> {
        let id = WorkerId::from_info(info);
        let mut workers = self.workers.write();

        let mut orphans = Vec::new();
        let restarted = match workers.get(&id) {
            None => true,
            Some(entry) => first_heartbeat || entry.max_slots != info.max_slots,
        };

        if restarted {
            if let Some(mut old) = workers.remove(&id) {
                orphans.extend(old.tasks_in_flight.drain().map(|(_, spec)| spec));
            }
            info!(worker = %id, slots = info.max_slots, "registering worker");
            workers.insert(
                id,
                WorkerEntry {
                    max_slots: info.max_slots,
                    current_slots: info.current_slots.min(info.max_slots),
                    last_heartbeat: now,
                    tasks_in_flight: HashMap::new(),
                    auth_suspect: false,
                },
            );
        } else if let Some(entry) = workers.get_mut(&id) {
            entry.current_slots = info.current_slots.min(entry.max_slots);
            entry.last_heartbeat = now;
        }

        orphans
    }

    /// Overwrite the cached slot count with the worker's own report.
    pub fn on_worker_update(&self, info: &WorkerInfo) {
        let id = WorkerId::from_info(info);
        if let Some(entry) = self.workers.write().get_mut(&id) {
            entry.current_slots = info.current_slots.min(entry.max_slots);
        }
    }

    /// Evict workers silent for longer than `timeout`; returns their load.
    pub fn reap_dead(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<TaskSpec> {
        let mut workers = self.workers.write();
        let mut orphans = Vec::new();

        workers.retain(|id, entry| {
            if now - entry.last_heartbeat > timeout {
                warn!(worker = %id, "worker timed out, evicting");
                orphans.extend(entry.tasks_in_flight.drain().map(|(_, spec)| spec));
                false
            } else {
                true
            }
        });

        orphans
    }

    /// Reserve slots for a task on the best candidate worker.
    ///
    /// Candidates are ordered by descending free slots, then by
    /// `(hostname, port)`, so placement is reproducible. The cached count is
    /// decremented and the task recorded in-flight atomically with the
    /// selection.
    pub fn reserve(&self, spec: &TaskSpec) -> Option<WorkerId> {
        let slots = spec.slots_taken();
        let mut workers = self.workers.write();

        let id = workers
            .iter()
            .filter(|(_, entry)| entry.current_slots >= slots)
            .max_by(|(a_id, a), (b_id, b)| {
                a.current_slots
                    .cmp(&b.current_slots)
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone())?;

        let entry = workers.get_mut(&id)?;
        entry.current_slots -= slots;
        entry.tasks_in_flight.insert(spec.id(), spec.clone());
        Some(id)
    }

    /// Roll back a reservation after a failed dispatch.
    pub fn release_failed(&self, worker: &WorkerId, task_id: &TaskId) -> Option<TaskSpec> {
        let mut workers = self.workers.write();
        let entry = workers.get_mut(worker)?;
        let spec = entry.tasks_in_flight.remove(task_id)?;
        entry.current_slots = (entry.current_slots + spec.slots_taken()).min(entry.max_slots);
        Some(spec)
    }

    /// Drop a task from in-flight bookkeeping once its callback arrived.
    ///
    /// Slots are not restored here: the worker publishes its own count when
    /// the job ends.
    pub fn complete(&self, task_id: &TaskId) -> bool {
        let mut workers = self.workers.write();
        for entry in workers.values_mut() {
            if entry.tasks_in_flight.remove(task_id).is_some() {
                return true;
            }
        }
        false
    }

    /// Record an auth rejection; returns true if one was already recorded
    /// (the caller should evict).
    pub fn mark_auth_suspect(&self, worker: &WorkerId) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(worker) {
            Some(entry) => std::mem::replace(&mut entry.auth_suspect, true),
            None => true,
        }
    }

    /// Evict a worker outright; returns its in-flight load for requeueing.
    pub fn evict(&self, worker: &WorkerId) -> Vec<TaskSpec> {
        let mut workers = self.workers.write();
        match workers.remove(worker) {
            Some(mut entry) => entry.tasks_in_flight.drain().map(|(_, spec)| spec).collect(),
            None => Vec::new(),
        }
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Snapshot for the operator status surface
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read();
        let mut snapshots: Vec<WorkerSnapshot> = workers
            .iter()
            .map(|(id, entry)| WorkerSnapshot {
                hostname: id.hostname.clone(),
                port: id.port,
                current_slots: entry.current_slots,
                max_slots: entry.max_slots,
                tasks_in_flight: entry.tasks_in_flight.len(),
                last_heartbeat: entry.last_heartbeat,
            })
            .collect();
        snapshots.sort_by(|a, b| (&a.hostname, a.port).cmp(&(&b.hostname, b.port)));
        snapshots
    }
}
