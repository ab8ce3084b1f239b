//! Task source backed by a JSON file; results are written as JSON lines.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use flowdeploy_remote::TaskSource;
use flowdeploy_types::{FlowDeployError, Result, Task};

/// A task file holds either one task or an array of tasks.
#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    Many(Vec<Task>),
    One(Box<Task>),
}

pub fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let json = std::fs::read_to_string(path)?;
    Ok(match serde_json::from_str(&json)? {
        TaskFile::Many(tasks) => tasks,
        TaskFile::One(task) => vec![*task],
    })
}

/// Hands out the file's tasks in a single batch, then reports nothing further.
pub struct FileTaskSource<W> {
    pending: Mutex<Vec<Task>>,
    out: Mutex<W>,
}

impl FileTaskSource<std::io::Stdout> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(read_tasks(path)?, std::io::stdout()))
    }
}

impl<W: Write + Send> FileTaskSource<W> {
    pub fn new(tasks: Vec<Task>, out: W) -> Self {
        Self {
            pending: Mutex::new(tasks),
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, line: Value) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| FlowDeployError::Other("result writer poisoned".into()))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn into_output(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send> TaskSource for FileTaskSource<W> {
    async fn fetch(&self) -> Result<Vec<Task>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| FlowDeployError::Other("task queue poisoned".into()))?;
        Ok(std::mem::take(&mut *pending))
    }

    async fn complete(&self, task: &Task, outputs: &Map<String, Value>) -> Result<()> {
        self.write_line(json!({
            "task_id": task.id,
            "process_instance_id": task.process_instance_id,
            "status": "completed",
            "outputs": outputs,
        }))
    }

    async fn fail(&self, task: &Task, message: &str) -> Result<()> {
        self.write_line(json!({
            "task_id": task.id,
            "process_instance_id": task.process_instance_id,
            "status": "failed",
            "error": message,
        }))
    }
}
