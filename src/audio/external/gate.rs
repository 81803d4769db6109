use tokio::sync::watch;

use crate::audio::error::PlayerError;

#[derive(Debug, Clone, PartialEq)]
pub enum GatePhase {
    Pending,
    Open,
    Rejected(PlayerError),
}

#[derive(Debug, Clone)]
struct GateState {
    phase: GatePhase,
    in_flight: bool,
}

/// One-shot readiness signal for the external process.
///
/// Opened once per process lifetime; a crash puts it back to `Pending`.
/// Waiters are released either way: `Open` lets them through and
/// `Rejected` fails them with `NotReady`.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState {
            phase: GatePhase::Pending,
            in_flight: false,
        });
        Self { tx }
    }

    pub fn phase(&self) -> GatePhase {
        self.tx.borrow().phase.clone()
    }

    pub fn is_open(&self) -> bool {
        self.tx.borrow().phase == GatePhase::Open
    }

    pub fn in_flight(&self) -> bool {
        self.tx.borrow().in_flight
    }

    /// Claims the single initialization slot. Only the caller that gets
    /// `true` may run the attempt; it must end it with [`complete`]. An open
    /// gate is never claimed.
    ///
    /// [`complete`]: ReadinessGate::complete
    pub fn try_begin(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.in_flight || state.phase == GatePhase::Open {
                return false;
            }
            state.in_flight = true;
            state.phase = GatePhase::Pending;
            true
        })
    }

    pub fn complete(&self, outcome: Result<(), PlayerError>) {
        self.tx.send_modify(|state| {
            state.in_flight = false;
            state.phase = match outcome {
                Ok(()) => GatePhase::Open,
                Err(err) => GatePhase::Rejected(err),
            };
        });
    }

    pub fn reject(&self, err: PlayerError) {
        self.tx.send_modify(|state| state.phase = GatePhase::Rejected(err));
    }

    /// Rejects the gate and frees the initialization slot, releasing
    /// everyone waiting on a running attempt. That attempt must not call
    /// [`complete`] afterwards.
    ///
    /// [`complete`]: ReadinessGate::complete
    pub fn abandon(&self, err: PlayerError) {
        self.tx.send_modify(|state| {
            state.in_flight = false;
            state.phase = GatePhase::Rejected(err);
        });
    }

    /// Ends an attempt without settling the gate: it stays `Pending` for
    /// the next attempt, which is already scheduled.
    pub fn release(&self) {
        self.tx.send_modify(|state| state.in_flight = false);
    }

    /// Puts a rejected gate back to `Pending` while no attempt is running.
    pub fn rearm(&self) {
        self.tx.send_if_modified(|state| {
            if state.in_flight || !matches!(state.phase, GatePhase::Rejected(_)) {
                return false;
            }
            state.phase = GatePhase::Pending;
            true
        });
    }

    /// Closes the gate again after the process went away.
    pub fn reset(&self) {
        self.tx.send_modify(|state| state.phase = GatePhase::Pending);
    }

    /// Waits until the gate opens or is rejected.
    pub async fn wait(&self) -> Result<(), PlayerError> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| state.phase != GatePhase::Pending)
            .await
            .map_err(|_| PlayerError::NotReady)?;
        match state.phase {
            GatePhase::Open => Ok(()),
            _ => Err(PlayerError::NotReady),
        }
    }

    /// Waits for the running attempt to finish and reports its outcome.
    pub async fn wait_settled(&self) -> Result<(), PlayerError> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| !state.in_flight)
            .await
            .map_err(|_| PlayerError::NotReady)?;
        match state.phase {
            GatePhase::Open => Ok(()),
            _ => Err(PlayerError::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[test]
    fn only_one_attempt_at_a_time() {
        let gate = ReadinessGate::new();
        assert!(gate.try_begin());
        assert!(!gate.try_begin());
        gate.complete(Ok(()));
        assert!(gate.is_open());
        assert!(!gate.try_begin());

        gate.reset();
        assert!(gate.try_begin());
        assert_eq!(gate.phase(), GatePhase::Pending);
    }

    #[tokio::test]
    async fn waiters_are_released_on_open() {
        let gate = Arc::new(ReadinessGate::new());
        assert!(gate.try_begin());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.complete(Ok(()));
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn waiters_fail_on_rejection() {
        let gate = Arc::new(ReadinessGate::new());
        assert!(gate.try_begin());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        gate.complete(Err(PlayerError::InitTimeout(10)));
        assert_eq!(waiter.await.unwrap(), Err(PlayerError::NotReady));
        assert_eq!(
            gate.phase(),
            GatePhase::Rejected(PlayerError::InitTimeout(10))
        );
    }

    #[tokio::test]
    async fn abandon_frees_the_slot() {
        let gate = Arc::new(ReadinessGate::new());
        assert!(gate.try_begin());

        let settled = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_settled().await })
        };
        gate.abandon(PlayerError::NotReady);
        assert_eq!(settled.await.unwrap(), Err(PlayerError::NotReady));
        assert!(!gate.in_flight());
        assert!(gate.try_begin());
    }

    #[test]
    fn rearm_only_touches_rejected_gates() {
        let gate = ReadinessGate::new();
        assert!(gate.try_begin());
        gate.complete(Err(PlayerError::InitFailed("boom".into())));
        gate.rearm();
        assert_eq!(gate.phase(), GatePhase::Pending);

        assert!(gate.try_begin());
        gate.complete(Ok(()));
        gate.rearm();
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn reset_makes_commands_wait_again() {
        let gate = ReadinessGate::new();
        assert!(gate.try_begin());
        gate.complete(Ok(()));
        gate.reset();
        let waited = tokio::time::timeout(Duration::from_millis(20), gate.wait()).await;
        assert!(waited.is_err());
    }
}
