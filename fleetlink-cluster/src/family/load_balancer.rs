//! Per-family worker selection
//!
//! Workers are kept in two lists. Unlocked workers are ordered by load and
//! walked with a cursor; locked workers are never handed out.
//!
//! The cursor only moves forward between full sorts: [`LoadBalancer::iterate`]
//! advances it when the current worker is at least as loaded as the next,
//! and [`LoadBalancer::complete_sort`] re-orders everything and resets it to
//! the front.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

use fleetlink_core::config::BalancingStrategy;
use fleetlink_core::models::{FamilyId, WorkerId};

use super::capability::Selectable;
use super::worker::Worker;
use crate::events::{EventSender, FleetEvent};

/// Load figures compared by the balancing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load {
    pub player_count: u32,
    pub weight: u32,
}

impl Load {
    #[must_use]
    pub fn of(worker: &Worker) -> Self {
        Self {
            player_count: worker.player_count(),
            weight: worker.weight(),
        }
    }
}

/// Ascending player count
#[must_use]
pub fn least_connection(a: &Load, b: &Load) -> Ordering {
    a.player_count.cmp(&b.player_count)
}

/// Ascending player count per unit of weight, heavier first on ties.
///
/// Compares `count / (weight + 1)` without dividing. With equal weights this
/// orders exactly like [`least_connection`].
#[must_use]
pub fn weighted_least_connection(a: &Load, b: &Load) -> Ordering {
    let lhs = u64::from(a.player_count) * (u64::from(b.weight) + 1);
    let rhs = u64::from(b.player_count) * (u64::from(a.weight) + 1);
    lhs.cmp(&rhs).then_with(|| b.weight.cmp(&a.weight))
}

#[must_use]
pub fn compare(strategy: BalancingStrategy, a: &Load, b: &Load) -> Ordering {
    match strategy {
        BalancingStrategy::LeastConnection => least_connection(a, b),
        BalancingStrategy::WeightedLeastConnection => weighted_least_connection(a, b),
    }
}

#[derive(Default)]
struct BalancerState {
    unlocked: Vec<Arc<Worker>>,
    locked: Vec<Arc<Worker>>,
    index: usize,
}

impl BalancerState {
    fn position(list: &[Arc<Worker>], id: WorkerId) -> Option<usize> {
        list.iter().position(|w| w.id() == id)
    }

    fn clamp_index(&mut self) {
        if self.index >= self.unlocked.len() {
            self.index = 0;
        }
    }

    fn remove_unlocked(&mut self, pos: usize) -> Arc<Worker> {
        let worker = self.unlocked.remove(pos);
        if pos < self.index {
            self.index -= 1;
        }
        self.clamp_index();
        worker
    }
}

pub struct LoadBalancer {
    strategy: BalancingStrategy,
    state: Mutex<BalancerState>,
    notify: Option<(FamilyId, EventSender)>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(strategy: BalancingStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(BalancerState::default()),
            notify: None,
        }
    }

    /// Balancer that reports lock changes of `family`'s workers on `events`
    #[must_use]
    pub fn with_events(strategy: BalancingStrategy, family: FamilyId, events: EventSender) -> Self {
        Self {
            notify: Some((family, events)),
            ..Self::new(strategy)
        }
    }

    fn lock_changed(&self, worker_id: WorkerId, locked: bool) {
        let Some((family, events)) = &self.notify else {
            return;
        };
        let family = family.clone();
        events.emit(if locked {
            FleetEvent::WorkerLocked { worker_id, family }
        } else {
            FleetEvent::WorkerUnlocked { worker_id, family }
        });
    }

    #[must_use]
    pub const fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    /// Add a worker. Returns `false` if it is already present.
    pub fn add(&self, worker: Arc<Worker>) -> bool {
        let mut state = self.state.lock();
        let id = worker.id();
        if BalancerState::position(&state.unlocked, id).is_some()
            || BalancerState::position(&state.locked, id).is_some()
        {
            return false;
        }

        if worker.is_locked() {
            state.locked.push(worker);
        } else {
            state.unlocked.push(worker);
        }
        true
    }

    /// Remove a worker from either list.
    pub fn remove(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        if let Some(pos) = BalancerState::position(&state.unlocked, id) {
            return Some(state.remove_unlocked(pos));
        }
        BalancerState::position(&state.locked, id).map(|pos| state.locked.remove(pos))
    }

    #[must_use]
    pub fn contains(&self, id: WorkerId) -> bool {
        let state = self.state.lock();
        BalancerState::position(&state.unlocked, id).is_some()
            || BalancerState::position(&state.locked, id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let state = self.state.lock();
        state
            .unlocked
            .iter()
            .chain(state.locked.iter())
            .find(|w| w.id() == id)
            .cloned()
    }

    /// Worker under the cursor
    #[must_use]
    pub fn current(&self) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        state.clamp_index();
        state.unlocked.get(state.index).cloned()
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.state.lock().index
    }

    /// Advance the cursor when the current worker has at least as many
    /// players as the next one.
    ///
    /// Only player counts are compared, whatever the strategy. Weights take
    /// part in [`LoadBalancer::complete_sort`] alone.
    pub fn iterate(&self) {
        let mut state = self.state.lock();
        state.clamp_index();
        let next = state.index + 1;
        if next >= state.unlocked.len() {
            return;
        }

        if state.unlocked[state.index].player_count() >= state.unlocked[next].player_count() {
            state.index = next;
            trace!(index = next, "Load balancer cursor advanced");
        }
    }

    /// Re-order all unlocked workers and reset the cursor.
    pub fn complete_sort(&self) {
        let mut state = self.state.lock();
        // Counts change concurrently; sort a snapshot so the order is consistent
        let mut keyed: Vec<(Load, Arc<Worker>)> = state
            .unlocked
            .drain(..)
            .map(|w| (Load::of(&w), w))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| compare(self.strategy, a, b));
        state.unlocked = keyed.into_iter().map(|(_, w)| w).collect();
        state.index = 0;
        debug!(
            workers = state.unlocked.len(),
            strategy = ?self.strategy,
            "Load balancer sorted"
        );
    }

    /// Lock a worker, taking it out of rotation. Returns `false` if it is
    /// not an unlocked member.
    pub fn lock(&self, id: WorkerId) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = BalancerState::position(&state.unlocked, id) else {
            return false;
        };
        if !state.unlocked[pos].try_lock() {
            return false;
        }
        let worker = state.remove_unlocked(pos);
        state.locked.push(worker);
        drop(state);
        self.lock_changed(id, true);
        true
    }

    /// Put a locked worker back into rotation. Returns `false` if it is not
    /// a locked member.
    pub fn unlock(&self, id: WorkerId) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = BalancerState::position(&state.locked, id) else {
            return false;
        };
        let worker = state.locked.remove(pos);
        worker.try_unlock();
        state.unlocked.push(worker);
        drop(state);
        self.lock_changed(id, false);
        true
    }

    /// Take the current worker and lock it in one step.
    pub fn select_and_lock(&self) -> Option<Arc<Worker>> {
        let mut state = self.state.lock();
        state.clamp_index();
        let pos = state.index;
        if !state.unlocked.get(pos)?.try_lock() {
            return None;
        }
        let worker = state.remove_unlocked(pos);
        state.locked.push(worker.clone());
        drop(state);
        self.lock_changed(worker.id(), true);
        Some(worker)
    }

    #[must_use]
    pub fn size(&self, include_locked: bool) -> usize {
        let state = self.state.lock();
        if include_locked {
            state.unlocked.len() + state.locked.len()
        } else {
            state.unlocked.len()
        }
    }

    /// Unlocked workers in rotation order
    #[must_use]
    pub fn unlocked(&self) -> Vec<Arc<Worker>> {
        self.state.lock().unlocked.clone()
    }

    #[must_use]
    pub fn locked(&self) -> Vec<Arc<Worker>> {
        self.state.lock().locked.clone()
    }

    #[must_use]
    pub fn player_count(&self) -> u32 {
        let state = self.state.lock();
        state
            .unlocked
            .iter()
            .chain(state.locked.iter())
            .map(|w| w.player_count())
            .sum()
    }
}

impl Selectable for LoadBalancer {
    type Item = Arc<Worker>;

    fn current(&self) -> Option<Arc<Worker>> {
        Self::current(self)
    }

    fn lock(&self, item: &Arc<Worker>) -> bool {
        Self::lock(self, item.id())
    }

    fn unlock(&self, item: &Arc<Worker>) -> bool {
        Self::unlock(self, item.id())
    }

    fn select_and_lock(&self) -> Option<Arc<Worker>> {
        Self::select_and_lock(self)
    }

    fn size(&self, include_locked: bool) -> usize {
        Self::size(self, include_locked)
    }
}
