//! Weighted, cancellable progress shared between the relocation worker and
//! whoever displays it.
//!
//! One thread drives the coordinator; any other thread may flip the cancel
//! token at any time. The token is a lone atomic so the worker can poll it
//! between copy chunks without taking the state lock.

use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    pub operations: u32,
    pub weight: u64,
}

impl Budget {
    pub fn add(&mut self, weight: u64) {
        self.operations += 1;
        self.weight += weight;
    }
}

/// Operations declared up front: the forward run plus enough capacity to
/// walk every step back again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressBudget {
    pub forward: Budget,
    pub rollback: Budget,
}

impl ProgressBudget {
    pub fn total(&self) -> Budget {
        Budget {
            operations: self.forward.operations + self.rollback.operations,
            weight: self.forward.weight + self.rollback.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub total_operations: u32,
    pub total_weight: u64,
    /// Number of operations started so far.
    pub operation: u32,
    pub description: String,
    pub operation_weight: u64,
    pub operation_percent: u32,
    /// Weight of all operations finished before the current one.
    pub completed_weight: u64,
    pub outcome: Option<Outcome>,
}

impl ProgressState {
    pub fn percent(&self) -> u32 {
        if self.outcome.is_some() {
            return 100;
        }
        if self.total_weight == 0 {
            return 0;
        }
        let done = self.completed_weight * 100
            + self.operation_weight * self.operation_percent as u64;
        ((done / self.total_weight) as u32).min(100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHandle(u32);

type Observer = Box<dyn Fn(&ProgressState) + Send + Sync>;

pub struct ProgressCoordinator {
    cancel: CancelToken,
    state: Mutex<ProgressState>,
    observer: Option<Observer>,
}

impl Default for ProgressCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCoordinator {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::default(),
            state: Mutex::new(ProgressState::default()),
            observer: None,
        }
    }

    /// Call `observer` with a snapshot after every state change.
    pub fn with_observer(mut self, observer: impl Fn(&ProgressState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn begin(&self, total_operations: u32, total_weight: u64) {
        self.update(|s| {
            *s = ProgressState {
                total_operations,
                total_weight: total_weight.max(1),
                ..ProgressState::default()
            };
        });
    }

    pub fn begin_budget(&self, budget: &ProgressBudget) {
        let total = budget.total();
        self.begin(total.operations, total.weight);
    }

    pub fn next_operation(&self, description: impl Into<String>, weight: u64) -> OperationHandle {
        let description = description.into();
        let mut handle = OperationHandle(0);
        self.update(|s| {
            if s.operation >= s.total_operations {
                warn!(
                    "progress: operation \"{}\" exceeds the {} declared operations",
                    description, s.total_operations
                );
                s.total_operations = s.operation + 1;
            }
            if s.operation > 0 {
                s.completed_weight += s.operation_weight;
            }
            s.operation += 1;
            s.operation_weight = weight;
            s.operation_percent = 0;
            s.description = description;
            handle = OperationHandle(s.operation);
        });
        handle
    }

    /// Consume a slot without doing any work.
    pub fn skip(&self, description: impl Into<String>) {
        self.next_operation(description, 0);
    }

    /// Consume zero-cost slots until `operations` slots have been started.
    pub fn skip_to(&self, operations: u32) {
        while self.state().operation < operations {
            self.skip("Skipped");
        }
    }

    pub fn set_percent(&self, handle: OperationHandle, percent: u32) {
        self.update(|s| {
            if s.operation == handle.0 {
                s.operation_percent = percent.min(100);
            }
        });
    }

    pub fn complete<T>(&self, result: &Result<T>) {
        self.update(|s| {
            if s.operation > 0 {
                s.completed_weight += s.operation_weight;
                s.operation_weight = 0;
            }
            s.outcome = Some(match result {
                Ok(_) => Outcome::Succeeded,
                Err(e) => Outcome::Failed(e.to_string()),
            });
        });
    }

    pub fn state(&self) -> ProgressState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut ProgressState)) {
        let snapshot = {
            let mut state = self.lock();
            f(&mut state);
            self.observer.as_ref().map(|_| state.clone())
        };
        if let (Some(observer), Some(snapshot)) = (&self.observer, snapshot) {
            observer(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn weighted_percentage() {
        let progress = ProgressCoordinator::new();
        progress.begin(2, 10);
        let op = progress.next_operation("first", 4);
        progress.set_percent(op, 50);
        assert_eq!(progress.state().percent(), 20);

        progress.next_operation("second", 6);
        assert_eq!(progress.state().percent(), 40);
        assert_eq!(progress.state().operation, 2);

        progress.complete(&Ok::<(), Error>(()));
        let state = progress.state();
        assert_eq!(state.outcome, Some(Outcome::Succeeded));
        assert_eq!(state.percent(), 100);
    }

    #[test]
    fn stale_handle_is_ignored() {
        let progress = ProgressCoordinator::new();
        progress.begin(2, 2);
        let first = progress.next_operation("first", 1);
        progress.next_operation("second", 1);
        progress.set_percent(first, 90);
        assert_eq!(progress.state().operation_percent, 0);
    }

    #[test]
    fn skip_to_fills_declared_slots() {
        let progress = ProgressCoordinator::new();
        let budget = ProgressBudget {
            forward: Budget {
                operations: 3,
                weight: 3,
            },
            rollback: Budget {
                operations: 3,
                weight: 3,
            },
        };
        progress.begin_budget(&budget);
        progress.next_operation("one", 1);
        progress.skip_to(budget.forward.operations);

        let state = progress.state();
        assert_eq!(state.operation, 3);
        assert_eq!(state.total_operations, 6);
        assert_eq!(state.operation_weight, 0);
    }

    #[test]
    fn cancel_from_another_thread() {
        let progress = ProgressCoordinator::new();
        let token = progress.cancel_token();
        std::thread::spawn(move || token.cancel())
            .join()
            .expect("cancel thread");
        assert!(progress.is_cancelled());
        assert!(matches!(progress.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn observer_sees_updates() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let progress = ProgressCoordinator::new().with_observer(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        progress.begin(1, 1);
        progress.next_operation("only", 1);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
