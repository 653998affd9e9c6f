//! The Client Coordinator (SPEC_FULL.md §4.6): owns the endpoint, the local
//! queues, and the Scheduler/Executor-pool/Collector threads; enforces the
//! strict shutdown ordering and the terminal-id handshake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shared::{PipelineError, Task};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collector::Collector;
use crate::executor::Executor;
use crate::queue::bounded;
use crate::remote::{RemoteQueue, TcpRemoteQueue};
use crate::scheduler::Scheduler;

/// The six configuration knobs enumerated in SPEC_FULL.md §6, resolved once
/// at coordinator construction and passed down as plain configuration
/// (SPEC_FULL.md §9, "cached-once computed properties").
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub num_tasks: usize,
    pub bundlesize: usize,
    pub bundlewait: Duration,
    pub host: String,
    pub port: u16,
    pub auth: String,
    pub template: String,
}

pub struct Coordinator {
    config: ClientConfig,
    halt: CancellationToken,
}

const SENTINEL_PUT_TIMEOUT: Duration = Duration::from_secs(5);

impl Coordinator {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            halt: CancellationToken::new(),
        }
    }

    /// A clone of the halt token, so `main` can cancel it from a signal
    /// handler without waiting on the coordinator's future first.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt.clone()
    }

    /// Acquire the endpoint and run the pipeline to completion.
    pub async fn run(self) -> anyhow::Result<()> {
        let remote = TcpRemoteQueue::connect(&self.config.host, self.config.port, &self.config.auth)
            .await
            .context("failed to acquire remote queue endpoint")?;
        self.run_with_remote(Arc::new(remote)).await
    }

    /// Run the pipeline against an already-acquired endpoint. Split out from
    /// [`Coordinator::run`] so tests can supply a [`crate::remote::MockRemoteQueue`]
    /// without a network dependency.
    pub async fn run_with_remote(self, remote: Arc<dyn RemoteQueue>) -> anyhow::Result<()> {
        let capacity = self.config.bundlesize.max(1);
        let (inbound_tx, inbound_rx) = bounded::<Task>(capacity);
        let (outbound_tx, outbound_rx) = bounded::<Task>(capacity);
        let hostname = shared::hostname::resolve();

        info!(
            num_tasks = self.config.num_tasks,
            bundlesize = self.config.bundlesize,
            bundlewait_secs = self.config.bundlewait.as_secs(),
            "starting client pipeline"
        );

        let scheduler = Scheduler::new(remote.clone(), inbound_tx.clone(), self.halt.clone());
        let scheduler_handle = tokio::spawn(scheduler.run());

        let collector = Collector::new(
            remote.clone(),
            outbound_rx,
            self.config.bundlesize,
            self.config.bundlewait,
            self.halt.clone(),
        );
        let collector_handle = tokio::spawn(collector.run());

        let mut executor_handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.num_tasks);
        for slot in 1..=self.config.num_tasks {
            let executor = Executor::new(
                slot,
                inbound_rx.clone(),
                outbound_tx.clone(),
                self.config.template.clone(),
                hostname.clone(),
                self.halt.clone(),
            );
            executor_handles.push(tokio::spawn(executor.run()));
        }

        let outcome = match scheduler_handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(pipeline_err)) => {
                self.halt.cancel();
                Self::drain(executor_handles, collector_handle).await;
                remote.close().await;
                return Err(anyhow::Error::new(pipeline_err).context("scheduler failed"));
            }
            Err(join_err) => {
                self.halt.cancel();
                Self::drain(executor_handles, collector_handle).await;
                remote.close().await;
                return Err(anyhow::anyhow!("scheduler task panicked: {join_err}"));
            }
        };

        // One null sentinel per executor: any executor may consume any
        // given sentinel since the pool shares one `inbound` queue.
        for _ in 0..self.config.num_tasks {
            let _ = inbound_tx.put(None, SENTINEL_PUT_TIMEOUT).await;
        }
        for handle in executor_handles {
            if let Err(join_err) = handle.await {
                error!(%join_err, "executor task panicked");
            }
        }

        let _ = outbound_tx.put(None, SENTINEL_PUT_TIMEOUT).await;
        match collector_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(pipeline_err)) => {
                remote.close().await;
                return Err(anyhow::Error::new(pipeline_err).context("collector failed"));
            }
            Err(join_err) => {
                remote.close().await;
                return Err(anyhow::anyhow!("collector task panicked: {join_err}"));
            }
        }

        remote
            .put_terminator(outcome.terminal_id.clone().into_bytes())
            .await
            .context("failed to publish terminator")?;

        remote.close().await;
        info!(terminal_id = %outcome.terminal_id, "client pipeline finished");
        Ok(())
    }

    /// Abnormal-termination path: the scheduler already signaled halt; wait
    /// for the rest of the pool to observe it and exit at their next state
    /// boundary (bounded by the ≤2s queue timeouts), without enforcing the
    /// normal sentinel-based ordering.
    async fn drain(
        executor_handles: Vec<JoinHandle<()>>,
        collector_handle: JoinHandle<Result<(), PipelineError>>,
    ) {
        for handle in executor_handles {
            let _ = handle.await;
        }
        let _ = collector_handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteQueue;
    use shared::Task;

    #[tokio::test]
    async fn echo_one_scenario() {
        let t1 = Task::new("t1", "echo hi").pack().unwrap();
        let remote = MockRemoteQueue::builder().bundle(vec![t1]).disconnect().build();

        let config = ClientConfig {
            num_tasks: 1,
            bundlesize: 10,
            bundlewait: Duration::from_secs(3600),
            host: "unused".into(),
            port: 0,
            auth: "unused".into(),
            template: "{}".into(),
        };
        Coordinator::new(config)
            .run_with_remote(remote.clone())
            .await
            .unwrap();

        let bundles = remote.completed_bundles().await;
        assert_eq!(bundles.len(), 1);
        let task = Task::unpack(&bundles[0][0]).unwrap();
        assert_eq!(task.id, "t1");
        assert_eq!(task.exit_status, Some(0));
        assert_eq!(remote.terminator().await, Some(b"t1".to_vec()));
    }

    #[tokio::test]
    async fn batch_by_size_scenario() {
        let tasks: Vec<_> = (1..=7)
            .map(|n| Task::new(format!("t{n}"), "true").pack().unwrap())
            .collect();
        let remote = MockRemoteQueue::builder().bundle(tasks).disconnect().build();

        let config = ClientConfig {
            num_tasks: 2,
            bundlesize: 3,
            bundlewait: Duration::from_secs(3600),
            host: "unused".into(),
            port: 0,
            auth: "unused".into(),
            template: "true".into(),
        };
        Coordinator::new(config)
            .run_with_remote(remote.clone())
            .await
            .unwrap();

        let bundles = remote.completed_bundles().await;
        let mut sizes: Vec<usize> = bundles.iter().map(|b| b.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3, 3]);
        assert_eq!(remote.terminator().await, Some(b"t7".to_vec()));
    }

    #[tokio::test]
    async fn non_zero_exit_scenario() {
        let t1 = Task::new("t1", "exit 7").pack().unwrap();
        let remote = MockRemoteQueue::builder().bundle(vec![t1]).disconnect().build();

        let config = ClientConfig {
            num_tasks: 1,
            bundlesize: 10,
            bundlewait: Duration::from_secs(3600),
            host: "unused".into(),
            port: 0,
            auth: "unused".into(),
            template: "sh -c '{}'".into(),
        };
        Coordinator::new(config)
            .run_with_remote(remote.clone())
            .await
            .unwrap();

        let bundles = remote.completed_bundles().await;
        let task = Task::unpack(&bundles[0][0]).unwrap();
        assert_eq!(task.exit_status, Some(7));
        assert_eq!(remote.terminator().await, Some(b"t1".to_vec()));
    }

    #[tokio::test]
    async fn backpressure_scenario_preserves_order_and_loses_nothing() {
        let tasks: Vec<_> = (1..=200)
            .map(|n| Task::new(format!("t{n}"), "true").pack().unwrap())
            .collect();
        let remote = MockRemoteQueue::builder().bundle(tasks).disconnect().build();

        let config = ClientConfig {
            num_tasks: 1,
            bundlesize: 4,
            bundlewait: Duration::from_secs(3600),
            host: "unused".into(),
            port: 0,
            auth: "unused".into(),
            template: "true".into(),
        };
        Coordinator::new(config)
            .run_with_remote(remote.clone())
            .await
            .unwrap();

        let bundles = remote.completed_bundles().await;
        let mut ids = Vec::new();
        for bundle in &bundles {
            for packed in bundle {
                ids.push(Task::unpack(packed).unwrap().id);
            }
        }
        assert_eq!(ids.len(), 200);
        let expected: Vec<String> = (1..=200).map(|n| format!("t{n}")).collect();
        assert_eq!(ids, expected);
    }
}
