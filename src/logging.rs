//! Metric sinks for routine scalars.
//!
//! Routines emit named scalars (`train_loss`, `hp/val_acc`, ...) through a
//! [`MetricsLogger`], which fans them out to any number of backends:
//! - Console logging (stdout)
//! - JSON-lines files, one object per scalar
//! - An in-memory recorder for inspection and tests

use crate::metrics::MetricValues;
use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Trait for logging backends.
pub trait LoggingBackend: Debug + Send {
    /// Log a scalar metric.
    ///
    /// # Arguments
    /// * `name` - Name of the metric
    /// * `value` - Value of the metric
    /// * `step` - Global step the value belongs to
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()>;

    /// Log a text message.
    fn log_text(&mut self, message: &str) -> TrainResult<()>;

    /// Flush any buffered logs.
    fn flush(&mut self) -> TrainResult<()>;
}

/// Prints scalars to stdout as `[step N] name: value`.
///
/// An optional key prefix restricts output to one metric family, for
/// example `hp/test_` to print only test results.
#[derive(Debug, Clone)]
pub struct ConsoleLogger {
    prefix: Option<String>,
    precision: usize,
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self {
            prefix: None,
            precision: 4,
        }
    }
}

impl ConsoleLogger {
    /// Print every scalar with four decimals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only print scalars whose name starts with `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Number of decimals printed.
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    fn accepts(&self, name: &str) -> bool {
        self.prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }
}

impl LoggingBackend for ConsoleLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        if self.accepts(name) {
            println!("[step {}] {}: {:.*}", step, name, self.precision, value);
        }
        Ok(())
    }

    fn log_text(&mut self, message: &str) -> TrainResult<()> {
        println!("{}", message);
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// One logged record, as written by [`JsonlLogger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRecord {
    /// A named scalar.
    Scalar {
        /// Metric name.
        name: String,
        /// Metric value.
        value: f64,
        /// Global step.
        step: usize,
    },
    /// A free-form message.
    Text {
        /// Message body.
        message: String,
    },
}

/// Writes one JSON object per record to a file.
#[derive(Debug)]
pub struct JsonlLogger {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlLogger {
    /// Create a JSON-lines logger, appending to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Create a JSON-lines logger, truncating the file if it exists.
    pub fn new_truncate<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Get the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &LogRecord) -> TrainResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl LoggingBackend for JsonlLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        self.write_record(&LogRecord::Scalar {
            name: name.to_string(),
            value,
            step,
        })
    }

    fn log_text(&mut self, message: &str) -> TrainResult<()> {
        self.write_record(&LogRecord::Text {
            message: message.to_string(),
        })
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Records every log call in memory.
///
/// Clones share the same record store, so a handle kept by the caller sees
/// what the copy handed to a [`MetricsLogger`] recorded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl InMemoryLogger {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far, in logging order.
    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every value logged under `name`, in logging order.
    pub fn scalars(&self, name: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                LogRecord::Scalar { name: n, value, .. } if n == name => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Most recent value logged under `name`.
    pub fn last_scalar(&self, name: &str) -> Option<f64> {
        self.scalars(name).last().copied()
    }

    fn push(&self, record: LogRecord) -> TrainResult<()> {
        self.records
            .lock()
            .map_err(|_| TrainError::Other("in-memory log store is poisoned".to_string()))?
            .push(record);
        Ok(())
    }
}

impl LoggingBackend for InMemoryLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        self.push(LogRecord::Scalar {
            name: name.to_string(),
            value,
            step,
        })
    }

    fn log_text(&mut self, message: &str) -> TrainResult<()> {
        self.push(LogRecord::Text {
            message: message.to_string(),
        })
    }

    fn flush(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Fans scalars out to every registered backend.
#[derive(Debug, Default)]
pub struct MetricsLogger {
    backends: Vec<Box<dyn LoggingBackend>>,
    current_step: usize,
}

impl MetricsLogger {
    /// Create a logger with no backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a logging backend.
    pub fn add_backend<B: LoggingBackend + 'static>(&mut self, backend: B) {
        self.backends.push(Box::new(backend));
    }

    /// Builder form of [`MetricsLogger::add_backend`].
    pub fn with_backend<B: LoggingBackend + 'static>(mut self, backend: B) -> Self {
        self.add_backend(backend);
        self
    }

    /// Log a scalar metric to all backends at the current step.
    pub fn log_metric(&mut self, name: &str, value: f64) -> TrainResult<()> {
        tracing::trace!(name, value, step = self.current_step, "scalar");
        for backend in &mut self.backends {
            backend.log_scalar(name, value, self.current_step)?;
        }
        Ok(())
    }

    /// Log every entry of a metric mapping, in key order.
    pub fn log_dict(&mut self, values: &MetricValues) -> TrainResult<()> {
        for (name, &value) in values {
            self.log_metric(name, value)?;
        }
        Ok(())
    }

    /// Log a text message to all backends.
    pub fn log_message(&mut self, message: &str) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.log_text(message)?;
        }
        Ok(())
    }

    /// Increment the step counter.
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Set the current step.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Get the current step.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Flush all backends.
    pub fn flush(&mut self) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.flush()?;
        }
        Ok(())
    }

    /// Get the number of backends.
    pub fn num_backends(&self) -> usize {
        self.backends.len()
    }
}
