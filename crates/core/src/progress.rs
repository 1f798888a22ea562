use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub phase: String,
    pub pages_total: Option<u64>,
    pub pages_done: Option<u64>,
    pub items_done: Option<u64>,
    pub bytes_written: Option<u64>,
    pub bytes_uploaded: Option<u64>,
}

impl TaskProgress {
    pub fn phase(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Self::default()
        }
    }

    /// Completed share in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match (self.pages_done, self.pages_total) {
            (_, Some(0)) => Some(1.0),
            (Some(done), Some(total)) => Some((done as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}
