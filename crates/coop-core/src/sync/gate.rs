//! Single-flight gate around sync cycles.
//!
//! At most one cycle runs per gate. A trigger that arrives while a cycle is
//! running does not start a second one; it schedules exactly one follow-up
//! cycle (no matter how many triggers arrive) and waits for it. Every caller
//! receives the summary of the last cycle that ran.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

use super::engine::SyncSummary;

type Outcome = Option<std::result::Result<SyncSummary, String>>;

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

/// Coalescing single-flight wrapper for one collection's cycles
#[derive(Debug)]
pub struct SyncGate {
    state: Mutex<GateState>,
    finished: watch::Sender<Outcome>,
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncGate {
    pub fn new() -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            state: Mutex::new(GateState::default()),
            finished,
        }
    }

    /// Whether a cycle is currently running
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Run `cycle`, or join the cycle already in flight.
    ///
    /// The caller that finds the gate idle runs `cycle` itself, repeating it
    /// once more if triggers arrived meanwhile. Other callers only wait.
    pub async fn run<F, Fut>(&self, mut cycle: F) -> Result<SyncSummary>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<SyncSummary>>,
    {
        let mut finished = self.finished.subscribe();
        let joined = {
            let mut state = self.state.lock();
            let joined = state.running;
            if joined {
                state.rerun = true;
            } else {
                state.running = true;
            }
            joined
        };
        if joined {
            tracing::debug!("Sync already running; scheduling one follow-up cycle");
            return wait_for(&mut finished).await;
        }

        let mut guard = RunGuard { gate: self, armed: true };
        loop {
            let outcome = cycle().await;
            let again = {
                let mut state = self.state.lock();
                let again = std::mem::take(&mut state.rerun);
                if !again {
                    state.running = false;
                }
                again
            };
            if !again {
                guard.armed = false;
                let shared = match &outcome {
                    Ok(summary) => Ok(summary.clone()),
                    Err(error) => Err(error.to_string()),
                };
                self.finished.send_replace(Some(shared));
                return outcome;
            }
            tracing::debug!("Running coalesced follow-up sync cycle");
        }
    }
}

async fn wait_for(finished: &mut watch::Receiver<Outcome>) -> Result<SyncSummary> {
    if finished.changed().await.is_err() {
        return Err(Error::Cycle("sync gate closed".to_string()));
    }
    let outcome = finished.borrow_and_update().clone();
    match outcome {
        Some(Ok(summary)) => Ok(summary),
        Some(Err(message)) => Err(Error::Cycle(message)),
        None => Err(Error::Cycle("no cycle result".to_string())),
    }
}

/// Releases the gate if the running caller is dropped mid-cycle
struct RunGuard<'a> {
    gate: &'a SyncGate,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.gate.state.lock();
            state.running = false;
            state.rerun = false;
        }
        self.gate.finished.send_replace(Some(Err(
            "sync cycle was abandoned before finishing".to_string(),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn counted_cycle(runs: &AtomicUsize) -> Result<SyncSummary> {
        let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(SyncSummary {
            created: run,
            ..SyncSummary::default()
        })
    }

    #[tokio::test]
    async fn overlapping_triggers_coalesce_into_one_follow_up() {
        let gate = SyncGate::new();
        let runs = AtomicUsize::new(0);

        let (first, second, third) = tokio::join!(
            gate.run(|| counted_cycle(&runs)),
            gate.run(|| counted_cycle(&runs)),
            gate.run(|| counted_cycle(&runs)),
        );

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(first.unwrap().created, 2);
        assert_eq!(second.unwrap().created, 2);
        assert_eq!(third.unwrap().created, 2);
        assert!(!gate.is_running());
    }

    #[tokio::test]
    async fn sequential_calls_each_run() {
        let gate = SyncGate::new();
        let runs = AtomicUsize::new(0);
        gate.run(|| counted_cycle(&runs)).await.unwrap();
        gate.run(|| counted_cycle(&runs)).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn waiters_see_runner_failure() {
        let gate = SyncGate::new();
        let (first, second) = tokio::join!(
            gate.run(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(Error::InvalidInput("disk full".to_string()))
            }),
            gate.run(|| async { Ok(SyncSummary::default()) }),
        );
        assert!(first.is_err());
        assert!(matches!(second, Err(Error::Cycle(_))));
    }

    #[tokio::test]
    async fn dropped_runner_releases_gate() {
        let gate = SyncGate::new();
        let runner = gate.run(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SyncSummary::default())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), runner).await;
        assert!(timed_out.is_err());
        assert!(!gate.is_running());
        assert!(gate.run(|| async { Ok(SyncSummary::default()) }).await.is_ok());
    }
}
