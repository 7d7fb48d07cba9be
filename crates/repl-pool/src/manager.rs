use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};
use uuid::Uuid;

use crate::repl::Repl;
use crate::types::{ReplConfig, ReplError};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub free: usize,
    pub busy: usize,
    pub capacity: usize,
}

/// Collections guarded by the pool lock.
///
/// Invariants: a tracked REPL is in exactly one of `free`/`busy`,
/// `free.len() + busy.len() <= capacity`, and nothing in `free` is killed.
#[derive(Default)]
struct PoolState {
    /// Idle processes in insertion order.
    free: Vec<Arc<Repl>>,
    /// Checked-out processes, including reservations still being started.
    busy: HashMap<Uuid, Arc<Repl>>,
    shut_down: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.free.len() + self.busy.len()
    }

    /// Remove and return the first idle REPL primed with `header`.
    ///
    /// Dead entries met on the way are removed and pushed onto `doomed`.
    fn take_reusable(&mut self, header: &str, doomed: &mut Vec<Arc<Repl>>) -> Option<Arc<Repl>> {
        let mut i = 0;
        while i < self.free.len() {
            let repl = &self.free[i];
            if repl.is_killed() || !repl.is_running() {
                doomed.push(self.free.remove(i));
            } else if repl.header() == header {
                return Some(self.free.remove(i));
            } else {
                i += 1;
            }
        }
        None
    }
}

/// A slot in `busy` held by a checkout that has not handed its REPL out yet.
///
/// If dropped while armed (the checkout failed or its future was cancelled),
/// the REPL is killed and its slot freed without awaiting anything.
struct Reservation<'a> {
    manager: &'a ReplManager,
    repl: Arc<Repl>,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(manager: &'a ReplManager, repl: Arc<Repl>) -> Self {
        Self {
            manager,
            repl,
            armed: true,
        }
    }

    fn repl(&self) -> &Arc<Repl> {
        &self.repl
    }

    /// Disarm and hand the REPL to the caller.
    fn complete(mut self) -> Arc<Repl> {
        self.armed = false;
        Arc::clone(&self.repl)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.repl.id();
        tracing::debug!(repl = %id, "Dropping REPL reservation");
        self.repl.abandon();

        match self.manager.state.try_lock() {
            Ok(mut state) => {
                state.busy.remove(&id);
            }
            // Whoever holds the lock, or takes it next, drops the entry.
            Err(_) => self
                .manager
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id),
        }
        self.manager.cond.notify_waiters();
    }
}

/// Bounded pool of Lean REPL processes.
///
/// The free and busy collections live behind one async mutex; `Notify` plays
/// the role of its condition variable. Callers queue when the pool is
/// saturated, and every waiter re-checks the pool after waking.
///
/// Spawning and priming run outside the lock: a new process first takes a
/// slot in `busy`, so capacity is respected while it starts. The slot is
/// guarded by a [`Reservation`], so a cancelled checkout gives it back.
pub struct ReplManager {
    config: Arc<ReplConfig>,
    state: Mutex<PoolState>,
    cond: Notify,
    /// Reservations dropped while `state` was locked.
    abandoned: std::sync::Mutex<Vec<Uuid>>,
}

impl ReplManager {
    pub fn new(config: ReplConfig) -> Result<Self, ReplError> {
        if config.max_repls == 0 {
            return Err(ReplError::Config("max_repls must be at least 1".into()));
        }
        tracing::info!(
            max_repls = config.max_repls,
            max_repl_uses = ?config.max_repl_uses,
            max_repl_mem_mb = ?config.max_repl_mem_mb,
            "REPL manager created"
        );
        Ok(Self {
            config: Arc::new(config),
            state: Mutex::new(PoolState::default()),
            cond: Notify::new(),
            abandoned: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.max_repls
    }

    /// Lock the pool state, dropping slots of reservations abandoned while
    /// it was held.
    async fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        let mut state = self.state.lock().await;
        for id in self.take_abandoned() {
            state.busy.remove(&id);
        }
        state
    }

    fn take_abandoned(&self) -> Vec<Uuid> {
        std::mem::take(&mut *self.abandoned.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.lock_state().await;
        PoolStats {
            free: state.free.len(),
            busy: state.busy.len(),
            capacity: self.capacity(),
        }
    }

    /// Start and prime the processes listed in `init_repls`.
    ///
    /// They land in the free list. Stops early, with a warning, once the pool
    /// is full. Individual start failures are logged and skipped.
    pub async fn initialize(&self, timeout: Duration) -> Result<(), ReplError> {
        let mut reserved = Vec::new();
        {
            let mut state = self.lock_state().await;
            if state.shut_down {
                return Err(ReplError::ShutDown);
            }
            'outer: for (header, count) in &self.config.init_repls {
                for _ in 0..*count {
                    if state.total() >= self.capacity() {
                        tracing::warn!(
                            capacity = self.capacity(),
                            "init_repls exceeds max_repls, skipping the rest"
                        );
                        break 'outer;
                    }
                    let repl = Arc::new(Repl::new(header.clone(), Arc::clone(&self.config)));
                    state.busy.insert(repl.id(), Arc::clone(&repl));
                    reserved.push(Reservation::new(self, repl));
                }
            }
        }

        let started = futures::future::join_all(
            reserved
                .into_iter()
                .map(|reservation| self.start_new(reservation, timeout)),
        )
        .await;

        let mut ready = 0;
        for result in started {
            match result {
                Ok(reservation) => {
                    self.release(reservation.repl()).await?;
                    reservation.complete();
                    ready += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to start initial REPL"),
            }
        }
        tracing::info!(ready, "REPL pool initialized");
        Ok(())
    }

    /// Get a REPL primed with `header`.
    ///
    /// With `reuse`, the first idle process primed with the same header is
    /// returned as is. Otherwise a new process is started (evicting the
    /// oldest idle one if the pool is full); if every slot is busy, this
    /// waits for a release. `timeout` bounds priming only.
    pub async fn checkout(
        &self,
        header: &str,
        snippet_id: &str,
        timeout: Duration,
        reuse: bool,
    ) -> Result<Arc<Repl>, ReplError> {
        loop {
            let mut state = self.lock_state().await;
            if state.shut_down {
                return Err(ReplError::ShutDown);
            }

            let mut doomed = Vec::new();
            if reuse {
                if let Some(repl) = state.take_reusable(header, &mut doomed) {
                    state.busy.insert(repl.id(), Arc::clone(&repl));
                    let reservation = Reservation::new(self, repl);
                    drop(state);
                    self.dispose(doomed).await;
                    let repl = reservation.complete();
                    tracing::debug!(repl = %repl.id(), snippet = snippet_id, "Reusing REPL");
                    return Ok(repl);
                }
            }

            if state.total() >= self.capacity() && !state.free.is_empty() {
                let oldest = state.free.remove(0);
                tracing::debug!(repl = %oldest.id(), "Evicting idle REPL to make room");
                doomed.push(oldest);
            }

            if state.total() < self.capacity() {
                let repl = Arc::new(Repl::new(header, Arc::clone(&self.config)));
                state.busy.insert(repl.id(), Arc::clone(&repl));
                let reservation = Reservation::new(self, repl);
                drop(state);
                self.dispose(doomed).await;
                tracing::debug!(
                    repl = %reservation.repl().id(),
                    snippet = snippet_id,
                    "Starting new REPL"
                );
                return Ok(self.start_new(reservation, timeout).await?.complete());
            }

            // Every slot is busy. Register for a wakeup before letting go of
            // the lock so a release in between is not missed. A reservation
            // dropped while we held the lock may have notified too early, so
            // look at the abandoned list once more after registering.
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let missed = !self
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            drop(state);
            self.dispose(doomed).await;
            if missed {
                continue;
            }

            tracing::debug!(snippet = snippet_id, "REPL pool saturated, waiting");
            notified.await;
        }
    }

    /// Spawn and prime a REPL that already holds a slot in `busy`.
    ///
    /// On failure the reservation is dropped, which frees the slot.
    async fn start_new<'a>(
        &'a self,
        reservation: Reservation<'a>,
        timeout: Duration,
    ) -> Result<Reservation<'a>, ReplError> {
        let repl = reservation.repl();
        let started = async {
            repl.spawn().await?;
            repl.prime(timeout).await
        };
        match started.await {
            Ok(()) => {
                tracing::info!(repl = %repl.id(), pid = repl.pid(), "REPL started");
                Ok(reservation)
            }
            Err(e) => {
                tracing::warn!(repl = %repl.id(), error = %e, "Failed to start REPL");
                repl.kill().await;
                Err(e)
            }
        }
    }

    /// Return a checked-out REPL to the pool.
    ///
    /// Killed or exited processes, and those that reached `max_repl_uses`,
    /// are destroyed instead of freed. Releasing a REPL that is not checked
    /// out is an error, except after [`cleanup`](Self::cleanup).
    pub async fn release(&self, repl: &Arc<Repl>) -> Result<(), ReplError> {
        let mut state = self.lock_state().await;
        if state.busy.remove(&repl.id()).is_none() {
            if state.shut_down {
                drop(state);
                repl.kill().await;
                return Ok(());
            }
            return Err(ReplError::NotCheckedOut(repl.id()));
        }

        let exhausted = self
            .config
            .max_repl_uses
            .is_some_and(|limit| repl.uses() >= limit);

        if state.shut_down || repl.is_killed() || !repl.is_running() || exhausted {
            drop(state);
            tracing::debug!(
                repl = %repl.id(),
                killed = repl.is_killed(),
                uses = repl.uses(),
                "Destroying REPL on release"
            );
            repl.kill().await;
        } else {
            state.free.push(Arc::clone(repl));
            drop(state);
            tracing::debug!(repl = %repl.id(), uses = repl.uses(), "REPL returned to pool");
        }

        self.cond.notify_waiters();
        Ok(())
    }

    /// Stop tracking a REPL and kill it. Tolerates REPLs that are already
    /// untracked or killed.
    pub async fn destroy(&self, repl: &Arc<Repl>) {
        {
            let mut state = self.lock_state().await;
            state.free.retain(|r| r.id() != repl.id());
            state.busy.remove(&repl.id());
        }
        repl.kill().await;
        self.cond.notify_waiters();
    }

    /// Kill every tracked REPL and refuse further checkouts.
    pub async fn cleanup(&self) {
        let repls: Vec<Arc<Repl>> = {
            let mut state = self.lock_state().await;
            state.shut_down = true;
            let mut repls: Vec<_> = state.free.drain(..).collect();
            repls.extend(state.busy.drain().map(|(_, repl)| repl));
            repls
        };

        tracing::info!(count = repls.len(), "Cleaning up REPL pool");
        futures::future::join_all(repls.iter().map(|repl| repl.kill())).await;
        self.cond.notify_waiters();
    }

    /// Kill REPLs already removed from tracking.
    ///
    /// Every group is signalled before the first await, so a cancelled
    /// caller leaves no process behind.
    async fn dispose(&self, doomed: Vec<Arc<Repl>>) {
        if doomed.is_empty() {
            return;
        }
        for repl in &doomed {
            repl.abandon();
        }
        futures::future::join_all(doomed.iter().map(|repl| repl.kill())).await;
        self.cond.notify_waiters();
    }

    #[cfg(test)]
    async fn insert_free(&self, repl: Arc<Repl>) {
        self.state.lock().await.free.push(repl);
    }

    #[cfg(test)]
    async fn insert_busy(&self, repl: Arc<Repl>) {
        self.state.lock().await.busy.insert(repl.id(), repl);
    }

    #[cfg(test)]
    async fn is_tracked(&self, id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.busy.contains_key(&id) || state.free.iter().any(|r| r.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_repls: usize) -> ReplManager {
        // Only the wakeup test spawns `cat`; elsewhere the REPLs stay unstarted.
        let mut config = ReplConfig::new("cat", Vec::new(), std::env::temp_dir());
        config.max_repls = max_repls;
        ReplManager::new(config).unwrap()
    }

    fn repl(m: &ReplManager, header: &str) -> Arc<Repl> {
        Arc::new(Repl::new(header, Arc::clone(&m.config)))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = ReplConfig::new("cat", Vec::new(), std::env::temp_dir());
        config.max_repls = 0;
        assert!(matches!(ReplManager::new(config), Err(ReplError::Config(_))));
    }

    #[tokio::test]
    async fn release_untracked_is_error() {
        let m = manager(2);
        let r = repl(&m, "");
        assert!(matches!(m.release(&r).await, Err(ReplError::NotCheckedOut(_))));
    }

    #[tokio::test]
    async fn release_killed_destroys() {
        let m = manager(2);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;
        r.kill().await;

        m.release(&r).await.unwrap();

        assert!(!m.is_tracked(r.id()).await);
        assert_eq!(m.stats().await, PoolStats { free: 0, busy: 0, capacity: 2 });
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let m = manager(2);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;
        r.kill().await;

        m.destroy(&r).await;
        m.destroy(&r).await;
        assert!(!m.is_tracked(r.id()).await);
        assert!(r.is_killed());
    }

    #[tokio::test]
    async fn reuse_scan_discards_dead_entries() {
        let m = manager(3);
        let dead = repl(&m, "import Mathlib");
        dead.kill().await;
        let unstarted = repl(&m, "import Mathlib");
        m.insert_free(Arc::clone(&dead)).await;
        m.insert_free(Arc::clone(&unstarted)).await;

        let mut doomed = Vec::new();
        let found = m
            .state
            .lock()
            .await
            .take_reusable("import Mathlib", &mut doomed);

        assert!(found.is_none());
        assert_eq!(doomed.len(), 2);
        assert_eq!(m.stats().await.free, 0);
    }

    #[tokio::test]
    async fn dropped_reservation_frees_slot() {
        let m = manager(1);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;

        drop(Reservation::new(&m, Arc::clone(&r)));

        assert!(r.is_killed());
        assert!(!m.is_tracked(r.id()).await);
        assert_eq!(m.stats().await.busy, 0);
    }

    #[tokio::test]
    async fn dropped_reservation_frees_slot_while_locked() {
        let m = manager(1);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;

        let state = m.state.lock().await;
        drop(Reservation::new(&m, Arc::clone(&r)));
        assert_eq!(state.busy.len(), 1);
        drop(state);

        assert!(r.is_killed());
        assert_eq!(m.stats().await, PoolStats { free: 0, busy: 0, capacity: 1 });
    }

    #[tokio::test]
    async fn completed_reservation_keeps_slot() {
        let m = manager(1);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;

        let handed_out = Reservation::new(&m, Arc::clone(&r)).complete();

        assert_eq!(handed_out.id(), r.id());
        assert!(!r.is_killed());
        assert!(m.is_tracked(r.id()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saturated_checkout_wakes_on_dropped_reservation() {
        let m = manager(1);
        let r = repl(&m, "");
        m.insert_busy(Arc::clone(&r)).await;
        let reservation = Reservation::new(&m, Arc::clone(&r));

        let (result, ()) = tokio::join!(
            tokio::time::timeout(
                Duration::from_secs(5),
                m.checkout("", "waiter", Duration::from_secs(1), true)
            ),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(reservation);
            }
        );

        // An empty header needs no prime, so the waiter gets a live `cat`.
        let started = result.unwrap().unwrap();
        assert_ne!(started.id(), r.id());
        assert!(started.is_running());
        assert!(r.is_killed());
        m.cleanup().await;
    }

    #[tokio::test]
    async fn cleanup_refuses_checkout() {
        let m = manager(1);
        let r = repl(&m, "");
        m.insert_free(Arc::clone(&r)).await;

        m.cleanup().await;

        assert!(r.is_killed());
        assert_eq!(m.stats().await, PoolStats { free: 0, busy: 0, capacity: 1 });
        let err = m
            .checkout("", "after-cleanup", Duration::from_secs(1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::ShutDown));
    }
}
