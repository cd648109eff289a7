use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::MEDIUM_UPGRADE_TIMEOUT;
use crate::ids::EndpointId;
use crate::medium::Medium;

type TransferTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    waiting_for_high_quality_medium: bool,
    pending_tasks: Vec<TransferTask>,
    timeout_timer: Option<JoinHandle<()>>,
}

/// Per-endpoint gate that delays queued sends until the connection reaches a
/// high-quality medium, or until the upgrade window closes.
pub struct TransferManager {
    endpoint_id: EndpointId,
    state: Mutex<State>,
}

impl TransferManager {
    /// Creates a gate for one endpoint, initially waiting for an upgrade.
    #[must_use]
    pub fn new(endpoint_id: EndpointId) -> Arc<Self> {
        Arc::new(Self {
            endpoint_id,
            state: Mutex::new(State {
                waiting_for_high_quality_medium: true,
                ..State::default()
            }),
        })
    }

    /// Queues `task`, or runs it immediately when the gate is already open.
    pub fn send(&self, task: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.state.lock().expect("transfer state poisoned");
            if state.waiting_for_high_quality_medium {
                state.pending_tasks.push(Box::new(task));
                None
            } else {
                Some(task)
            }
        };
        if let Some(task) = run_now {
            task();
        }
    }

    /// Arms the upgrade deadline. Returns `false` when the gate was already
    /// opened or armed.
    pub fn start_transfer(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().expect("transfer state poisoned");
        if !state.waiting_for_high_quality_medium || state.timeout_timer.is_some() {
            return false;
        }
        let manager = Arc::clone(self);
        state.timeout_timer = Some(tokio::spawn(async move {
            sleep(MEDIUM_UPGRADE_TIMEOUT).await;
            info!(endpoint_id = %manager.endpoint_id, "medium upgrade window closed; flushing sends");
            manager.flush();
        }));
        true
    }

    /// Opens the gate when the endpoint reached a high-quality medium.
    pub fn on_medium_quality_changed(&self, current_medium: Medium) {
        if current_medium.is_high_quality() {
            debug!(
                endpoint_id = %self.endpoint_id,
                medium = %current_medium,
                "high-quality medium active; flushing sends"
            );
            self.flush();
        }
    }

    /// Drops queued sends and closes the waiting state. Returns `false` when
    /// nothing was pending.
    pub fn cancel_transfer(&self) -> bool {
        let mut state = self.state.lock().expect("transfer state poisoned");
        if let Some(timer) = state.timeout_timer.take() {
            timer.abort();
        }
        let had_pending = !state.pending_tasks.is_empty();
        state.pending_tasks.clear();
        state.waiting_for_high_quality_medium = false;
        had_pending
    }

    fn flush(&self) {
        let tasks = {
            let mut state = self.state.lock().expect("transfer state poisoned");
            if let Some(timer) = state.timeout_timer.take() {
                timer.abort();
            }
            state.waiting_for_high_quality_medium = false;
            std::mem::take(&mut state.pending_tasks)
        };
        for task in tasks {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn counted_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn tasks_queue_until_medium_quality_improves() {
        let manager = TransferManager::new(EndpointId::from("E1"));
        let ran = Arc::new(AtomicUsize::new(0));
        manager.send(counted_task(&ran));
        assert_eq!(0, ran.load(Ordering::SeqCst));

        manager.on_medium_quality_changed(Medium::Ble);
        assert_eq!(0, ran.load(Ordering::SeqCst));

        manager.on_medium_quality_changed(Medium::WifiLan);
        assert_eq!(1, ran.load(Ordering::SeqCst));

        // Once open, sends run directly.
        manager.send(counted_task(&ran));
        assert_eq!(2, ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_flushes_queued_tasks() {
        let manager = TransferManager::new(EndpointId::from("E1"));
        let ran = Arc::new(AtomicUsize::new(0));
        manager.send(counted_task(&ran));

        assert_eq!(true, manager.start_transfer());
        assert_eq!(false, manager.start_transfer());

        tokio::time::sleep(MEDIUM_UPGRADE_TIMEOUT + Duration::from_millis(50)).await;
        assert_eq!(1, ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_drops_queued_tasks() {
        let manager = TransferManager::new(EndpointId::from("E1"));
        let ran = Arc::new(AtomicUsize::new(0));
        manager.send(counted_task(&ran));

        assert_eq!(true, manager.cancel_transfer());
        manager.on_medium_quality_changed(Medium::WifiLan);
        assert_eq!(0, ran.load(Ordering::SeqCst));
    }
}
