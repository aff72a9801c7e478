//! Append-only, sequence-numbered script output.
//!
//! A log has at most one writer at a time and any number of readers. The
//! k-th appended entry carries sequence number `k`, so a cursor of `0`
//! means "nothing read yet" and `get_output(cursor)` returns everything
//! after it along with the new cursor.

use futures_util::Stream;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

use tentacle_protocol::{ProcessOutput, ProcessOutputSource};

use crate::error::TentacleError;

#[derive(Debug)]
struct HistoryFile {
    file: File,
    path: PathBuf,
}

impl HistoryFile {
    fn append(&mut self, output: &ProcessOutput) -> Result<(), TentacleError> {
        let line = serde_json::to_string(output)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<ProcessOutput>,
    writer_open: bool,
    finished: bool,
    history: Option<HistoryFile>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LogState>,
    appended: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to one script's output. Clones refer to the same log.
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    shared: Arc<Shared>,
}

impl ScriptLog {
    /// In-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log persisted as JSON lines at `path`. Existing entries are loaded
    /// so a restarted process serves the same sequence numbers. The log
    /// counts as finished until a writer is created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TentacleError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            read_history(&path)?
        } else {
            Vec::new()
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "opened script log");

        let log = Self::default();
        {
            let mut state = log.shared.lock();
            state.entries = entries;
            state.finished = true;
            state.history = Some(HistoryFile { file, path });
        }
        Ok(log)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.shared.lock().history.as_ref().map(|h| h.path.clone())
    }

    /// Take the single writer for this log.
    pub fn create_writer(&self) -> Result<ScriptLogWriter, TentacleError> {
        let mut state = self.shared.lock();
        if state.writer_open {
            return Err(TentacleError::WriterAlreadyOpen);
        }
        state.writer_open = true;
        state.finished = false;
        Ok(ScriptLogWriter {
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }

    /// Everything appended after `after_sequence`, plus the cursor to pass
    /// next time.
    pub fn get_output(&self, after_sequence: i64) -> (Vec<ProcessOutput>, i64) {
        let state = self.shared.lock();
        let (entries, next) = slice_after(&state.entries, after_sequence);
        (entries.to_vec(), next)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the last writer has finished and no new one was opened.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// Stream `(sequence, output)` pairs after `after_sequence`, waiting for
    /// new entries until the writer finishes.
    pub fn follow(
        &self,
        after_sequence: i64,
    ) -> impl Stream<Item = (i64, ProcessOutput)> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        async_stream::stream! {
            let mut cursor = after_sequence.max(0);
            loop {
                let appended = shared.appended.notified();
                let (batch, finished) = {
                    let state = shared.lock();
                    let (entries, _) = slice_after(&state.entries, cursor);
                    (entries.to_vec(), state.finished)
                };

                if batch.is_empty() {
                    if finished {
                        break;
                    }
                    appended.await;
                    continue;
                }

                for output in batch {
                    cursor += 1;
                    yield (cursor, output);
                }
            }
        }
    }
}

fn slice_after(entries: &[ProcessOutput], after_sequence: i64) -> (&[ProcessOutput], i64) {
    let len = entries.len() as i64;
    let start = after_sequence.clamp(0, len);
    (&entries[start as usize..], after_sequence.max(len))
}

fn read_history(path: &Path) -> Result<Vec<ProcessOutput>, TentacleError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut last_occurred: Option<SystemTime> = None;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProcessOutput>(&line) {
            Ok(output) => {
                last_occurred = Some(output.occurred_at);
                entries.push(output);
            }
            Err(err) => {
                warn!(path = %path.display(), line = index + 1, "corrupt script log: {err}");
                // Nothing is written after a writer dies mid-line, so stop here.
                entries.push(ProcessOutput::at(
                    ProcessOutputSource::StdErr,
                    format!(
                        "Corrupt log at line {}, no more logs will be read",
                        index + 1
                    ),
                    last_occurred.unwrap_or_else(SystemTime::now),
                ));
                break;
            }
        }
    }

    Ok(entries)
}

/// Append side of a [`ScriptLog`]. Dropping it finishes the log.
#[derive(Debug)]
pub struct ScriptLogWriter {
    shared: Arc<Shared>,
    closed: bool,
}

impl ScriptLogWriter {
    pub fn write_output(
        &mut self,
        source: ProcessOutputSource,
        text: impl Into<String>,
    ) -> Result<i64, TentacleError> {
        self.write(ProcessOutput::new(source, text))
    }

    /// Append one entry and return its sequence number.
    pub fn write(&mut self, output: ProcessOutput) -> Result<i64, TentacleError> {
        let sequence = {
            let mut state = self.shared.lock();
            if let Some(history) = state.history.as_mut() {
                history.append(&output)?;
            }
            state.entries.push(output);
            state.entries.len() as i64
        };
        self.shared.appended.notify_waiters();
        Ok(sequence)
    }

    pub fn write_all<I>(&mut self, outputs: I) -> Result<i64, TentacleError>
    where
        I: IntoIterator<Item = ProcessOutput>,
    {
        let mut last = self.shared.lock().entries.len() as i64;
        for output in outputs {
            last = self.write(output)?;
        }
        Ok(last)
    }

    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        {
            let mut state = self.shared.lock();
            state.writer_open = false;
            state.finished = true;
        }
        self.shared.appended.notify_waiters();
    }
}

impl Drop for ScriptLogWriter {
    fn drop(&mut self) {
        self.close();
    }
}
