//! The unit of work that flows through the pipeline, and the wire-level
//! bundle shape it travels in.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single shell command handed down by the server and, eventually, handed
/// back with its outcome.
///
/// `id` and `args` arrive populated from the server; every other field is
/// filled in by the executor that runs the task. Fields are public because
/// every stage of the pipeline (scheduler, executor, collector) needs to
/// read or set a different subset of them directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub args: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_time: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completion_time: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_host: Option<String>,
}

impl Task {
    /// Construct a freshly-scheduled task as it arrives from the server: only
    /// `id` and `args` are known.
    pub fn new(id: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: args.into(),
            command: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            client_host: None,
        }
    }

    /// Render this task's command by substituting every occurrence of `{}`
    /// in `template` with the raw argument string, and record it on the task.
    pub fn render_command(&mut self, template: &str) {
        self.command = Some(template.replace("{}", &self.args));
    }

    /// True once the executor has recorded an exit status for this task.
    pub fn is_finished(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Opaque byte-level pack, treated by the client as a black box: it never
    /// interprets the bytes beyond round-tripping them through [`Task::unpack`].
    pub fn pack(&self) -> Result<PackedTask> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Inverse of [`Task::pack`].
    pub fn unpack(bytes: &[u8]) -> Result<Task> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A task in its opaque, on-the-wire byte form.
pub type PackedTask = Vec<u8>;

/// An ordered sequence of packed tasks, transmitted as a unit on `scheduled`
/// or `completed`. Never legal as an empty, non-null sequence on the wire
/// (see SPEC_FULL.md §9 for why the empty case is rejected rather than
/// silently accepted).
pub type Bundle = Vec<PackedTask>;

/// Unpack every task in a bundle, preserving order, and report the id of the
/// last one — the running terminal-id candidate the Scheduler tracks.
pub fn unpack_bundle(bundle: &Bundle) -> Result<(Vec<Task>, String)> {
    if bundle.is_empty() {
        return Err(
            crate::error::PipelineError::Protocol("received empty non-null bundle".into()).into(),
        );
    }
    let tasks: Vec<Task> = bundle
        .iter()
        .map(|packed| Task::unpack(packed))
        .collect::<Result<_>>()?;
    let terminal_id = tasks
        .last()
        .expect("checked non-empty above")
        .id
        .clone();
    Ok((tasks, terminal_id))
}

/// Pack a slice of finished tasks into wire form, preserving order.
pub fn pack_bundle(tasks: &[Task]) -> Result<Bundle> {
    tasks.iter().map(Task::pack).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let mut task = Task::new("t1", "echo hi");
        task.render_command("{}");
        task.exit_status = Some(0);

        let packed = task.pack().expect("pack");
        let unpacked = Task::unpack(&packed).expect("unpack");
        assert_eq!(task, unpacked);
    }

    #[test]
    fn render_command_substitutes_every_occurrence() {
        let mut task = Task::new("t1", "x");
        task.render_command("echo {} && echo {}");
        assert_eq!(task.command.as_deref(), Some("echo x && echo x"));
    }

    #[test]
    fn unpack_bundle_tracks_last_task_id() {
        let a = Task::new("a", "true").pack().unwrap();
        let b = Task::new("b", "true").pack().unwrap();
        let (tasks, terminal_id) = unpack_bundle(&vec![a, b]).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(terminal_id, "b");
    }

    #[test]
    fn unpack_bundle_rejects_empty() {
        let result = unpack_bundle(&Bundle::new());
        assert!(result.is_err());
    }
}
