//! Single-flight gate over the session refresh.
//!
//! The first caller to hit an expired session becomes the leader and performs
//! the refresh; everyone arriving while it is in flight gets a receiver and is
//! released, in arrival order, with the leader's outcome.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::StatusError;

pub type RefreshOutcome = Result<(), StatusError>;

#[derive(Default)]
struct GateState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Flag and wait queue, always mutated together under one lock.
#[derive(Default)]
pub struct RefreshGate {
    state: Mutex<GateState>,
}

/// What `RefreshGate::begin` hands back.
pub enum Ticket<'a> {
    /// No refresh was running: the caller must run it and settle the guard.
    Leader(LeaderGuard<'a>),
    /// A refresh is running: await its outcome.
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            tracing::debug!(queued = state.waiters.len(), "refresh in flight, request queued");
            Ticket::Waiter(rx)
        } else {
            state.in_flight = true;
            tracing::debug!("starting session refresh");
            Ticket::Leader(LeaderGuard {
                gate: self,
                settled: false,
            })
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of callers parked behind the current refresh.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        tracing::debug!(
            waiters = waiters.len(),
            ok = outcome.is_ok(),
            "session refresh settled"
        );
        for waiter in waiters {
            // A waiter whose caller went away has nothing left to release.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the caller running the refresh. Dropping it unsettled (the leader's
/// future was cancelled, or it panicked) releases every waiter with
/// `RefreshAbandoned` and clears the in-flight flag.
pub struct LeaderGuard<'a> {
    gate: &'a RefreshGate,
    settled: bool,
}

impl LeaderGuard<'_> {
    pub fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.gate.settle(outcome);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.gate.settle(Err(StatusError::RefreshAbandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ApiError;

    fn expect_leader(ticket: Ticket<'_>) -> LeaderGuard<'_> {
        match ticket {
            Ticket::Leader(guard) => guard,
            Ticket::Waiter(_) => panic!("expected leader"),
        }
    }

    fn expect_waiter(ticket: Ticket<'_>) -> oneshot::Receiver<RefreshOutcome> {
        match ticket {
            Ticket::Waiter(rx) => rx,
            Ticket::Leader(_) => panic!("expected waiter"),
        }
    }

    #[tokio::test]
    async fn second_caller_waits_for_leader() {
        let gate = RefreshGate::new();
        let leader = expect_leader(gate.begin());
        assert!(gate.is_refreshing());

        let rx1 = expect_waiter(gate.begin());
        let rx2 = expect_waiter(gate.begin());
        assert_eq!(gate.queued(), 2);

        leader.settle(Ok(()));
        assert!(!gate.is_refreshing());
        assert_eq!(gate.queued(), 0);
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn waiters_are_released_in_arrival_order() {
        let gate = RefreshGate::new();
        let leader = expect_leader(gate.begin());
        let released = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..5 {
            let rx = expect_waiter(gate.begin());
            let released = Arc::clone(&released);
            tasks.push(tokio::spawn(async move {
                rx.await.unwrap().unwrap();
                released.lock().unwrap().push(i);
            }));
        }
        // Let every task park on its receiver before the refresh settles.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        leader.settle(Ok(()));
        for task in tasks {
            task.await.unwrap();
        }

        // Current-thread runtime: tasks run in the order they were woken.
        assert_eq!(*released.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_fans_out_to_every_waiter() {
        let gate = RefreshGate::new();
        let leader = expect_leader(gate.begin());
        let waiters: Vec<_> = (0..3).map(|_| expect_waiter(gate.begin())).collect();

        leader.settle(Err(StatusError::Http(ApiError::new(500, "refresh failed"))));
        for rx in waiters {
            let err = rx.await.unwrap().unwrap_err();
            assert_eq!(err.status(), Some(500));
        }
    }

    #[tokio::test]
    async fn dropped_leader_releases_waiters() {
        let gate = RefreshGate::new();
        let leader = expect_leader(gate.begin());
        let rx = expect_waiter(gate.begin());

        drop(leader);
        assert!(!gate.is_refreshing());
        assert!(matches!(
            rx.await.unwrap(),
            Err(StatusError::RefreshAbandoned)
        ));
    }

    #[test]
    fn gate_reopens_after_settle() {
        let gate = RefreshGate::new();
        expect_leader(gate.begin()).settle(Ok(()));
        // Next storm gets a fresh leader, not a waiter.
        let again = expect_leader(gate.begin());
        let rx = expect_waiter(gate.begin());
        again.settle(Ok(()));
        assert!(!gate.is_refreshing());
        assert!(tokio_test::block_on(rx).unwrap().is_ok());
    }
}
