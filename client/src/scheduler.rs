//! The Scheduler FSM (SPEC_FULL.md §4.3): `START → GET_REMOTE ⇄ UNPACK →
//! POP_TASK ⇄ PUT_LOCAL → HALT`.

use std::sync::Arc;
use std::time::Duration;

use shared::{Bundle, PipelineError, Task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::queue::LocalSender;
use crate::remote::RemoteQueue;

const GET_REMOTE_TIMEOUT: Duration = Duration::from_secs(2);
const PUT_LOCAL_TIMEOUT: Duration = Duration::from_secs(2);

enum State {
    GetRemote,
    Unpack(Bundle),
    PopTask,
    PutLocal(Task),
    Halt,
}

pub struct Scheduler {
    remote: Arc<dyn RemoteQueue>,
    inbound: LocalSender<Task>,
    halt: CancellationToken,
    pending: Vec<Task>,
    terminal_id: Option<String>,
    fatal: Option<PipelineError>,
}

/// Outcome of a Scheduler run: the terminal id it committed to forward (empty
/// if the server disconnected before ever sending a task), or a fatal error
/// that the Coordinator must treat as class (f) from SPEC_FULL.md §7.
pub struct SchedulerOutcome {
    pub terminal_id: String,
}

impl Scheduler {
    pub fn new(
        remote: Arc<dyn RemoteQueue>,
        inbound: LocalSender<Task>,
        halt: CancellationToken,
    ) -> Self {
        Self {
            remote,
            inbound,
            halt,
            pending: Vec::new(),
            terminal_id: None,
            fatal: None,
        }
    }

    pub async fn run(mut self) -> Result<SchedulerOutcome, PipelineError> {
        info!("scheduler starting");
        let mut state = State::GetRemote;
        loop {
            state = match state {
                State::GetRemote => self.get_remote().await,
                State::Unpack(bundle) => self.unpack(bundle),
                State::PopTask => self.pop_task(),
                State::PutLocal(task) => self.put_local(task).await,
                State::Halt => break,
            };
        }
        info!("scheduler halted");

        if let Some(err) = self.fatal {
            return Err(err);
        }
        Ok(SchedulerOutcome {
            terminal_id: self.terminal_id.unwrap_or_default(),
        })
    }

    async fn get_remote(&mut self) -> State {
        if self.halt.is_cancelled() {
            return State::Halt;
        }
        match self.remote.get_scheduled(GET_REMOTE_TIMEOUT).await {
            Ok(Some(bundle)) => State::Unpack(bundle),
            Ok(None) => {
                debug!("server disconnected on scheduled channel");
                State::Halt
            }
            Err(PipelineError::Empty(_)) => {
                trace!("scheduled channel empty, retrying");
                State::GetRemote
            }
            Err(err) => {
                error!(%err, "fatal error reading scheduled channel");
                self.fatal = Some(err);
                State::Halt
            }
        }
    }

    fn unpack(&mut self, bundle: Bundle) -> State {
        match shared::unpack_bundle(&bundle) {
            Ok((tasks, terminal_id)) => {
                self.terminal_id = Some(terminal_id);
                self.pending = tasks;
                State::PopTask
            }
            Err(err) => {
                match err.downcast::<PipelineError>() {
                    Ok(PipelineError::Protocol(msg)) => {
                        // Resolved Open Question (SPEC_FULL.md §9): an empty,
                        // non-null bundle is a protocol violation. The source
                        // would panic indexing tasks[-1]; we halt instead.
                        error!(%msg, "empty bundle on scheduled channel, halting");
                        State::Halt
                    }
                    Ok(other) => {
                        error!(err = %other, "fatal error decoding bundle");
                        self.fatal = Some(other);
                        State::Halt
                    }
                    Err(err) => {
                        error!(%err, "fatal error decoding bundle");
                        self.fatal = Some(PipelineError::Protocol(err.to_string()));
                        State::Halt
                    }
                }
            }
        }
    }

    fn pop_task(&mut self) -> State {
        if self.pending.is_empty() {
            State::GetRemote
        } else {
            State::PutLocal(self.pending.remove(0))
        }
    }

    async fn put_local(&mut self, task: Task) -> State {
        match self.inbound.put(Some(task.clone()), PUT_LOCAL_TIMEOUT).await {
            Ok(()) => State::PopTask,
            Err(PipelineError::Full(_)) => {
                if self.halt.is_cancelled() {
                    debug!(task_id = %task.id, "halt observed while inbound full, halting");
                    return State::Halt;
                }
                trace!(task_id = %task.id, "inbound full, retrying");
                State::PutLocal(task)
            }
            Err(err) => {
                error!(%err, "fatal error pushing to inbound");
                self.fatal = Some(err);
                State::Halt
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use crate::remote::MockRemoteQueue;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn forwards_tasks_in_order_and_reports_terminal_id() {
        let t1 = Task::new("t1", "echo a").pack().unwrap();
        let t2 = Task::new("t2", "echo b").pack().unwrap();
        let remote = MockRemoteQueue::builder()
            .bundle(vec![t1, t2])
            .disconnect()
            .build();
        let (inbound_tx, inbound_rx) = bounded::<Task>(4);
        let scheduler = Scheduler::new(remote, inbound_tx, CancellationToken::new());

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.terminal_id, "t2");

        let first = inbound_rx.get(StdDuration::from_millis(50)).await.unwrap();
        let second = inbound_rx.get(StdDuration::from_millis(50)).await.unwrap();
        assert_eq!(first.unwrap().id, "t1");
        assert_eq!(second.unwrap().id, "t2");
    }

    #[tokio::test]
    async fn empty_non_null_bundle_halts_without_panicking() {
        let remote = MockRemoteQueue::builder().bundle(vec![]).build();
        let (inbound_tx, _inbound_rx) = bounded::<Task>(4);
        let scheduler = Scheduler::new(remote, inbound_tx, CancellationToken::new());

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.terminal_id, "");
    }

    #[tokio::test(start_paused = true)]
    async fn halt_signal_breaks_put_local_retry_on_permanently_full_inbound() {
        let remote = MockRemoteQueue::builder().build();
        let (inbound_tx, _inbound_rx) = bounded::<Task>(1);
        // Fill the only slot and never drain it, so every retry in
        // `put_local` observes `Full`.
        inbound_tx
            .put(Some(Task::new("filler", "true")), StdDuration::from_millis(50))
            .await
            .unwrap();

        let halt = CancellationToken::new();
        let mut scheduler = Scheduler::new(remote, inbound_tx, halt.clone());
        halt.cancel();

        let put = tokio::spawn(async move { scheduler.put_local(Task::new("t1", "true")).await });
        tokio::time::advance(PUT_LOCAL_TIMEOUT + Duration::from_millis(1)).await;
        let next_state = put.await.unwrap();
        assert!(matches!(next_state, State::Halt));
    }

    #[tokio::test]
    async fn halt_signal_stops_the_loop() {
        let remote = MockRemoteQueue::builder().build();
        let (inbound_tx, _inbound_rx) = bounded::<Task>(4);
        let halt = CancellationToken::new();
        halt.cancel();
        let scheduler = Scheduler::new(remote, inbound_tx, halt);

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome.terminal_id, "");
    }
}
