//! The Collector FSM (SPEC_FULL.md §4.5): `START → GET_LOCAL ⇄ CHECK_BUNDLE
//! ⇄ PACK_BUNDLE → PUT_REMOTE → GET_LOCAL`, with `FINALIZE → HALT` on
//! shutdown. Batches finished tasks by size or elapsed time before returning
//! them to the server.

use std::sync::Arc;
use std::time::Duration;

use shared::{PipelineError, Task};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::queue::LocalReceiver;
use crate::remote::RemoteQueue;

const GET_LOCAL_TIMEOUT: Duration = Duration::from_secs(1);

enum State {
    GetLocal,
    CheckBundle,
    PackBundle,
    PutRemote,
    Finalize,
    Halt,
}

pub struct Collector {
    remote: Arc<dyn RemoteQueue>,
    outbound: LocalReceiver<Task>,
    bundlesize: usize,
    bundlewait: Duration,
    halt: CancellationToken,
    pending: Vec<Task>,
    previous_send: Instant,
}

impl Collector {
    pub fn new(
        remote: Arc<dyn RemoteQueue>,
        outbound: LocalReceiver<Task>,
        bundlesize: usize,
        bundlewait: Duration,
        halt: CancellationToken,
    ) -> Self {
        Self {
            remote,
            outbound,
            bundlesize,
            bundlewait,
            halt,
            pending: Vec::new(),
            previous_send: Instant::now(),
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!("collector starting");
        let mut state = State::GetLocal;
        let mut fatal = None;
        loop {
            state = match state {
                State::GetLocal => self.get_local().await,
                State::CheckBundle => self.check_bundle(),
                State::PackBundle => State::PutRemote,
                State::PutRemote => match self.put_remote().await {
                    Ok(next) => next,
                    Err(err) => {
                        fatal = Some(err);
                        State::Halt
                    }
                },
                State::Finalize => match self.put_remote().await {
                    Ok(_) => State::Halt,
                    Err(err) => {
                        fatal = Some(err);
                        State::Halt
                    }
                },
                State::Halt => break,
            };
        }
        info!("collector halted");
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn get_local(&mut self) -> State {
        if self.halt.is_cancelled() {
            return State::Finalize;
        }
        match self.outbound.get(GET_LOCAL_TIMEOUT).await {
            Ok(Some(task)) => {
                self.pending.push(task);
                State::CheckBundle
            }
            // Empty still routes through CHECK_BUNDLE so the time policy can
            // fire on an idle pipeline (SPEC_FULL.md §4.5).
            Err(PipelineError::Empty(_)) => State::CheckBundle,
            Ok(None) => {
                debug!("received sentinel, finalizing");
                State::Finalize
            }
            Err(err) => {
                error!(%err, "outbound queue disconnected");
                State::Finalize
            }
        }
    }

    fn check_bundle(&mut self) -> State {
        let size_triggered = self.pending.len() >= self.bundlesize;
        let time_triggered = self.previous_send.elapsed() >= self.bundlewait;
        if size_triggered || time_triggered {
            State::PackBundle
        } else {
            State::GetLocal
        }
    }

    async fn put_remote(&mut self) -> Result<State, PipelineError> {
        if self.pending.is_empty() {
            // Time-triggered empty flush is a no-op: never return an empty
            // bundle to the server on an idle client (SPEC_FULL.md §4.5).
            return Ok(State::GetLocal);
        }
        let bundle = shared::pack_bundle(&self.pending).map_err(|e| {
            PipelineError::Protocol(format!("failed to pack outbound bundle: {e}"))
        })?;
        trace!(count = self.pending.len(), "flushing bundle");
        self.remote.put_completed(bundle).await?;
        self.pending.clear();
        self.previous_send = Instant::now();
        Ok(State::GetLocal)
    }
}
