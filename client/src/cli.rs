//! Command-line surface for the six configuration knobs (SPEC_FULL.md §10.1).
//! There is no configuration file: a restart starts from empty state, so
//! nothing here is persisted between runs.

use std::time::Duration;

use clap::Parser;
use shared::PipelineError;

use crate::coordinator::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "Pulls task bundles from a remote queue, runs them locally, and returns completion status", long_about = None)]
pub struct CliArgs {
    /// Number of concurrent executor slots.
    #[arg(short = 'n', long = "num-tasks", default_value_t = 1)]
    pub num_tasks: usize,

    /// Outbound batch size threshold before a size-triggered flush.
    #[arg(short = 'b', long = "bundlesize")]
    pub bundlesize: usize,

    /// Seconds since the last flush before a time-triggered flush.
    #[arg(short = 'w', long = "bundlewait")]
    pub bundlewait: u64,

    /// Remote queue server host.
    #[arg(short = 'H', long = "host")]
    pub host: String,

    /// Remote queue server port.
    #[arg(short = 'p', long = "port")]
    pub port: u16,

    /// Shared hex secret negotiated at connection time.
    #[arg(long = "auth")]
    pub auth: String,

    /// Command template; every `{}` is replaced with a task's raw argument string.
    #[arg(short = 't', long = "template", default_value = "{}")]
    pub template: String,
}

impl CliArgs {
    /// Validate and convert into the coordinator's configuration type.
    /// Mirrors this workspace's existing convention of naming exactly which
    /// field is wrong rather than returning a bare validation failure.
    pub fn into_config(self) -> Result<ClientConfig, PipelineError> {
        if self.num_tasks < 1 {
            return Err(PipelineError::Protocol(
                "num_tasks must be at least 1".to_string(),
            ));
        }
        if self.bundlesize < 1 {
            return Err(PipelineError::Protocol(
                "bundlesize must be at least 1".to_string(),
            ));
        }
        if !self.template.contains("{}") {
            return Err(PipelineError::Protocol(format!(
                "template {:?} does not contain a {{}} placeholder",
                self.template
            )));
        }

        Ok(ClientConfig {
            num_tasks: self.num_tasks,
            bundlesize: self.bundlesize,
            bundlewait: Duration::from_secs(self.bundlewait),
            host: self.host,
            port: self.port,
            auth: self.auth,
            template: self.template,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(num_tasks: usize, bundlesize: usize, template: &str) -> CliArgs {
        CliArgs {
            num_tasks,
            bundlesize,
            bundlewait: 0,
            host: "localhost".into(),
            port: 9000,
            auth: "deadbeef".into(),
            template: template.to_string(),
        }
    }

    #[test]
    fn rejects_zero_num_tasks() {
        assert!(args(0, 1, "{}").into_config().is_err());
    }

    #[test]
    fn rejects_zero_bundlesize() {
        assert!(args(1, 0, "{}").into_config().is_err());
    }

    #[test]
    fn rejects_template_without_placeholder() {
        assert!(args(1, 1, "echo hello").into_config().is_err());
    }

    #[test]
    fn accepts_valid_args() {
        assert!(args(2, 4, "sh -c '{}'").into_config().is_ok());
    }
}
