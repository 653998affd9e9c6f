//! The Executor FSM (SPEC_FULL.md §4.4), one instance per worker slot:
//! `START → GET_LOCAL ⇄ START_TASK → WAIT_TASK → PUT_LOCAL ⇄ FINALIZE → HALT`.

use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use shared::{PipelineError, Task};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::queue::{LocalReceiver, LocalSender};

const GET_LOCAL_TIMEOUT: Duration = Duration::from_secs(1);
const WAIT_TASK_TIMEOUT: Duration = Duration::from_secs(2);
const PUT_LOCAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Env var carrying the task id into the child process.
const TASK_ID_VAR: &str = "TASK_ID";
/// Env var carrying the raw argument string into the child process.
const TASK_ARGS_VAR: &str = "TASK_ARGS";

enum State {
    GetLocal,
    StartTask(Task),
    WaitTask(Task, Box<Child>),
    PutLocal(Task),
    Finalize,
    Halt,
}

pub struct Executor {
    id: usize,
    inbound: LocalReceiver<Task>,
    outbound: LocalSender<Task>,
    template: String,
    hostname: String,
    halt: CancellationToken,
}

impl Executor {
    pub fn new(
        id: usize,
        inbound: LocalReceiver<Task>,
        outbound: LocalSender<Task>,
        template: String,
        hostname: String,
        halt: CancellationToken,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound,
            template,
            hostname,
            halt,
        }
    }

    pub async fn run(mut self) {
        info!(slot = self.id, "executor starting");
        let mut state = State::GetLocal;
        loop {
            state = match state {
                State::GetLocal => self.get_local().await,
                State::StartTask(task) => self.start_task(task),
                State::WaitTask(task, child) => self.wait_task(task, child).await,
                State::PutLocal(task) => self.put_local(task).await,
                State::Finalize => State::Halt,
                State::Halt => break,
            };
        }
        info!(slot = self.id, "executor halted");
    }

    async fn get_local(&mut self) -> State {
        if self.halt.is_cancelled() {
            return State::Finalize;
        }
        match self.inbound.get(GET_LOCAL_TIMEOUT).await {
            Ok(Some(task)) => State::StartTask(task),
            Ok(None) => {
                debug!(slot = self.id, "received sentinel, finalizing");
                State::Finalize
            }
            Err(PipelineError::Empty(_)) => State::GetLocal,
            Err(err) => {
                error!(slot = self.id, %err, "inbound queue disconnected");
                State::Finalize
            }
        }
    }

    fn start_task(&mut self, mut task: Task) -> State {
        task.render_command(&self.template);
        task.start_time = Some(Local::now());
        task.client_host = Some(self.hostname.clone());

        let command = task
            .command
            .clone()
            .expect("render_command always sets command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .envs(std::env::vars())
            .env(TASK_ID_VAR, &task.id)
            .env(TASK_ARGS_VAR, &task.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        trace!(slot = self.id, task_id = %task.id, %command, "spawning task");
        match cmd.spawn() {
            Ok(child) => State::WaitTask(task, Box::new(child)),
            Err(source) => {
                warn!(slot = self.id, task_id = %task.id, %source, "failed to spawn task");
                task.exit_status = Some(-1);
                task.completion_time = Some(Local::now());
                State::PutLocal(task)
            }
        }
    }

    async fn wait_task(&mut self, mut task: Task, mut child: Box<Child>) -> State {
        match tokio::time::timeout(WAIT_TASK_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                task.exit_status = Some(status.code().unwrap_or(-1));
                task.completion_time = Some(Local::now());
                State::PutLocal(task)
            }
            Ok(Err(err)) => {
                warn!(slot = self.id, task_id = %task.id, %err, "error waiting on child");
                task.exit_status = Some(-1);
                task.completion_time = Some(Local::now());
                State::PutLocal(task)
            }
            Err(_) => State::WaitTask(task, child),
        }
    }

    async fn put_local(&mut self, task: Task) -> State {
        match self.outbound.put(Some(task.clone()), PUT_LOCAL_TIMEOUT).await {
            Ok(()) => State::GetLocal,
            Err(PipelineError::Full(_)) => {
                if self.halt.is_cancelled() {
                    debug!(slot = self.id, task_id = %task.id, "halt observed while outbound full, finalizing");
                    return State::Finalize;
                }
                trace!(slot = self.id, task_id = %task.id, "outbound full, retrying");
                State::PutLocal(task)
            }
            Err(err) => {
                error!(slot = self.id, %err, "outbound queue disconnected");
                State::Finalize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn runs_echo_task_to_completion() {
        let (inbound_tx, inbound_rx) = bounded::<Task>(2);
        let (outbound_tx, outbound_rx) = bounded::<Task>(2);
        inbound_tx
            .put(Some(Task::new("t1", "hi")), StdDuration::from_millis(50))
            .await
            .unwrap();
        inbound_tx.put(None, StdDuration::from_millis(50)).await.unwrap();

        let executor = Executor::new(
            1,
            inbound_rx,
            outbound_tx,
            "echo {}".to_string(),
            "test-host".to_string(),
            CancellationToken::new(),
        );
        executor.run().await;

        let finished = outbound_rx
            .get(StdDuration::from_millis(200))
            .await
            .unwrap()
            .expect("task returned");
        assert_eq!(finished.id, "t1");
        assert_eq!(finished.exit_status, Some(0));
        assert!(finished.completion_time.unwrap() >= finished.start_time.unwrap());
    }

    #[tokio::test]
    async fn non_zero_exit_is_surfaced_not_crashed() {
        let (inbound_tx, inbound_rx) = bounded::<Task>(2);
        let (outbound_tx, outbound_rx) = bounded::<Task>(2);
        inbound_tx
            .put(Some(Task::new("t1", "exit 7")), StdDuration::from_millis(50))
            .await
            .unwrap();
        inbound_tx.put(None, StdDuration::from_millis(50)).await.unwrap();

        let executor = Executor::new(
            1,
            inbound_rx,
            outbound_tx,
            "sh -c '{}'".to_string(),
            "test-host".to_string(),
            CancellationToken::new(),
        );
        executor.run().await;

        let finished = outbound_rx
            .get(StdDuration::from_millis(200))
            .await
            .unwrap()
            .expect("task returned");
        assert_eq!(finished.exit_status, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn halt_signal_breaks_put_local_retry_on_permanently_full_outbound() {
        let (_inbound_tx, inbound_rx) = bounded::<Task>(2);
        let (outbound_tx, _never_drained) = bounded::<Task>(1);
        // Fill the only slot and never drain it, so every retry in
        // `put_local` observes `Full`.
        outbound_tx
            .put(Some(Task::new("filler", "true")), StdDuration::from_millis(50))
            .await
            .unwrap();

        let halt = CancellationToken::new();
        let mut executor = Executor::new(
            1,
            inbound_rx,
            outbound_tx,
            "true".to_string(),
            "test-host".to_string(),
            halt.clone(),
        );
        halt.cancel();

        let put = tokio::spawn(async move { executor.put_local(Task::new("t1", "true")).await });
        tokio::time::advance(PUT_LOCAL_TIMEOUT + Duration::from_millis(1)).await;
        let next_state = put.await.unwrap();
        assert!(matches!(next_state, State::Finalize));
    }

    #[tokio::test]
    async fn template_with_repeated_placeholder_substitutes_all() {
        let mut task = Task::new("t1", "x");
        task.render_command("echo {} {}");
        assert_eq!(task.command.as_deref(), Some("echo x x"));
    }
}
