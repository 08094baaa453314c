//! Per-step loss traces

use serde::{Deserialize, Serialize};

/// Losses of one run, one per optimizer step
///
/// Only a finished run produces a trace, and it has no mutating API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossTrace {
    config_id: String,
    values: Vec<f32>,
}

impl LossTrace {
    /// Identifier of the configuration that produced this trace.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<f32> {
        self.values.get(step).copied()
    }
}

/// Collects micro-batch losses and closes them into per-step entries
#[derive(Debug)]
pub(crate) struct TraceRecorder {
    config_id: String,
    values: Vec<f32>,
    window: Vec<f32>,
}

impl TraceRecorder {
    pub(crate) fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            values: Vec::new(),
            window: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, loss: f32) {
        self.window.push(loss);
    }

    /// Micro-batches recorded since the last step.
    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Close the accumulation window: its entry is the mean micro-batch loss.
    pub(crate) fn close_window(&mut self) -> Option<f32> {
        if self.window.is_empty() {
            return None;
        }
        let loss = if self.window.len() == 1 {
            self.window[0]
        } else {
            let sum: f64 = self.window.iter().map(|&l| f64::from(l)).sum();
            (sum / self.window.len() as f64) as f32
        };
        self.window.clear();
        self.values.push(loss);
        Some(loss)
    }

    pub(crate) fn finish(self) -> LossTrace {
        LossTrace {
            config_id: self.config_id,
            values: self.values,
        }
    }
}

#[cfg(test)]
pub(crate) fn trace(config_id: &str, values: &[f32]) -> LossTrace {
    LossTrace {
        config_id: config_id.to_string(),
        values: values.to_vec(),
    }
}
