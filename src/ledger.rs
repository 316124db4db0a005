use crate::error::HubError;
use crate::model::{Run, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(50);
const SPOOL_NAME_LIMIT: usize = 160;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub status: Option<RunStatus>,
    pub script: Option<String>,
}

/// One line of the ledger file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Entry {
    Run(Run),
    Deleted {
        id: String,
        #[serde(with = "time::serde::rfc3339")]
        deleted_at: OffsetDateTime,
    },
}

/// Durable run history backed by an append-only JSON Lines file.
///
/// Every write is a single line; deletions append a tombstone and
/// [`Ledger::compact`] rewrites the file without them. Writers in every
/// process serialize on an advisory lock held on `<ledger>.lock`.
///
/// Runs that could not be written are spooled to `<ledger>.pending.jsonl`,
/// or to a file under the system temp directory when the ledger directory is
/// unusable, and stay readable until a later write drains them.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    write_lock: Mutex<()>,
    pending: Mutex<Vec<Run>>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists a terminal run.
    ///
    /// Retries with exponential backoff; if storage stays unavailable the run
    /// is spooled, still readable through `get`/`list` from any process, and
    /// written on the next successful append or [`Ledger::flush_pending`].
    pub fn append(&self, run: &Run) -> Result<(), HubError> {
        if !run.is_terminal() {
            return Err(HubError::storage(format!(
                "run {} is not terminal and cannot be recorded",
                run.id
            )));
        }

        let _guard = lock(&self.write_lock);

        let mut last_err = String::new();
        for attempt in 0..APPEND_ATTEMPTS {
            let written = self.lock_file().and_then(|_file_lock| {
                self.flush_pending_locked()?;
                self.write_entry(&Entry::Run(run.clone()))
            });

            match written {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        run_id = %run.id,
                        attempt = attempt + 1,
                        error = %err,
                        "ledger append failed"
                    );
                    last_err = err;
                }
            }

            if attempt + 1 < APPEND_ATTEMPTS {
                thread::sleep(APPEND_BACKOFF * (1_u32 << attempt));
            }
        }

        self.hold(run);
        Err(HubError::Storage(last_err))
    }

    /// Writes runs that an earlier append, in this or another process,
    /// could not persist. Returns how many were written.
    pub fn flush_pending(&self) -> Result<usize, HubError> {
        let _guard = lock(&self.write_lock);
        let _file_lock = self.lock_file().map_err(HubError::Storage)?;
        let count = self.held_runs().len();
        self.flush_pending_locked().map_err(HubError::Storage)?;
        Ok(count)
    }

    pub fn pending_count(&self) -> usize {
        self.held_runs().len()
    }

    pub fn get(&self, id: &str) -> Result<Run, HubError> {
        self.load()?
            .remove(id)
            .ok_or_else(|| HubError::NotFound(id.to_string()))
    }

    /// Runs newest first by start time, ties broken by id.
    pub fn list(
        &self,
        limit: Option<usize>,
        offset: usize,
        filter: &Filter,
    ) -> Result<Vec<Run>, HubError> {
        let mut runs: Vec<Run> = self
            .load()?
            .into_values()
            .filter(|run| matches_filter(run, filter))
            .collect();

        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let runs = runs.into_iter().skip(offset);
        Ok(match limit {
            Some(limit) => runs.take(limit).collect(),
            None => runs.collect(),
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), HubError> {
        let _guard = lock(&self.write_lock);

        let held = self.held_runs();
        if held.iter().any(|run| run.id == id) {
            let keep: Vec<Run> = held.into_iter().filter(|run| run.id != id).collect();
            self.replace_held(keep);
            return Ok(());
        }

        let _file_lock = self.lock_file().map_err(HubError::Storage)?;
        if !self.load_persisted()?.contains_key(id) {
            return Err(HubError::NotFound(id.to_string()));
        }

        self.write_entry(&Entry::Deleted {
            id: id.to_string(),
            deleted_at: OffsetDateTime::now_utc(),
        })
        .map_err(HubError::Storage)
    }

    /// Rewrites the file with only live runs, dropping tombstones and
    /// unreadable lines. Returns how many runs were kept.
    pub fn compact(&self) -> Result<usize, HubError> {
        let _guard = lock(&self.write_lock);
        let _file_lock = self.lock_file().map_err(HubError::Storage)?;
        self.flush_pending_locked().map_err(HubError::Storage)?;

        let mut runs: Vec<Run> = self.load_persisted()?.into_values().collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));

        let parent = self.parent_dir().map_err(HubError::Storage)?;
        fs::create_dir_all(&parent)
            .map_err(|e| HubError::storage(format!("create ledger directory: {e}")))?;

        let tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| HubError::storage(format!("create temp ledger: {e}")))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            for run in &runs {
                let line = serde_json::to_vec(&Entry::Run(run.clone()))
                    .map_err(|e| HubError::storage(format!("serialize run: {e}")))?;
                writer
                    .write_all(&line)
                    .and_then(|_| writer.write_all(b"\n"))
                    .map_err(|e| HubError::storage(format!("write temp ledger: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| HubError::storage(format!("flush temp ledger: {e}")))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| HubError::storage(format!("sync temp ledger: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| HubError::storage(format!("replace ledger: {e}")))?;

        tracing::info!(path = %self.path.display(), kept = runs.len(), "ledger compacted");
        Ok(runs.len())
    }

    fn load(&self) -> Result<HashMap<String, Run>, HubError> {
        let pending = self.held_runs();
        let mut runs = match self.load_persisted() {
            Ok(runs) => runs,
            // held runs stay readable while the file is unreachable
            Err(err) if !pending.is_empty() => {
                tracing::warn!(error = %err, held = pending.len(), "serving held runs only");
                HashMap::new()
            }
            Err(err) => return Err(err),
        };
        for run in pending {
            runs.entry(run.id.clone()).or_insert(run);
        }
        Ok(runs)
    }

    fn load_persisted(&self) -> Result<HashMap<String, Run>, HubError> {
        let entries = read_entries(&self.path)
            .map_err(|e| HubError::storage(format!("open ledger: {e}")))?;

        let mut runs = HashMap::new();
        let mut deleted = HashSet::new();

        for entry in entries {
            match entry {
                // first write wins; runs are immutable once recorded
                Entry::Run(run) => {
                    runs.entry(run.id.clone()).or_insert(run);
                }
                Entry::Deleted { id, .. } => {
                    deleted.insert(id);
                }
            }
        }

        runs.retain(|id, _| !deleted.contains(id));
        Ok(runs)
    }

    /// Caller holds both the in-process and the file lock.
    fn flush_pending_locked(&self) -> Result<(), String> {
        let held = self.held_runs();
        if held.is_empty() {
            return Ok(());
        }

        // an interrupted earlier flush may have written some of them already
        let persisted = self.load_persisted().map_err(|e| e.to_string())?;
        for run in held.iter().filter(|run| !persisted.contains_key(&run.id)) {
            self.write_entry(&Entry::Run(run.clone()))?;
        }

        lock(&self.pending).clear();
        for path in self.spool_paths() {
            remove_if_exists(&path);
        }
        tracing::info!(path = %self.path.display(), flushed = held.len(), "held runs written");
        Ok(())
    }

    /// Keeps a run that could not be written, on disk when possible.
    fn hold(&self, run: &Run) {
        {
            let mut pending = lock(&self.pending);
            if !pending.iter().any(|held| held.id == run.id) {
                pending.push(run.clone());
            }
        }

        for path in self.spool_paths() {
            match append_line(&path, &Entry::Run(run.clone())) {
                Ok(()) => {
                    tracing::warn!(run_id = %run.id, spool = %path.display(), "run held for retry");
                    return;
                }
                Err(err) => {
                    tracing::debug!(spool = %path.display(), error = %err, "spool unavailable");
                }
            }
        }
        tracing::warn!(run_id = %run.id, "run held in memory only");
    }

    /// Held runs from memory and every spool file, first seen wins.
    fn held_runs(&self) -> Vec<Run> {
        let mut seen = HashSet::new();
        let mut runs = Vec::new();

        let spooled = self
            .spool_paths()
            .into_iter()
            .flat_map(|path| read_entries(&path).unwrap_or_default());
        let in_memory = lock(&self.pending).clone();

        for run in in_memory.into_iter().chain(spooled.filter_map(|entry| match entry {
            Entry::Run(run) => Some(run),
            Entry::Deleted { .. } => None,
        })) {
            if seen.insert(run.id.clone()) {
                runs.push(run);
            }
        }
        runs
    }

    fn replace_held(&self, runs: Vec<Run>) {
        for path in self.spool_paths() {
            remove_if_exists(&path);
        }
        *lock(&self.pending) = Vec::new();
        for run in &runs {
            self.hold(run);
        }
    }

    /// `<ledger>.pending.jsonl`, then a per-ledger file in the temp directory.
    fn spool_paths(&self) -> [PathBuf; 2] {
        let sidecar = sibling(&self.path, ".pending.jsonl");

        let flat: String = self
            .path
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let tail = &flat[flat.len().saturating_sub(SPOOL_NAME_LIMIT)..];
        let fallback = std::env::temp_dir().join(format!("scripthub-pending-{tail}.jsonl"));

        [sidecar, fallback]
    }

    /// Exclusive advisory lock shared by every process writing this ledger.
    fn lock_file(&self) -> Result<FileLock, String> {
        let parent = self.parent_dir()?;
        fs::create_dir_all(&parent).map_err(|e| format!("create ledger directory: {e}"))?;

        let path = sibling(&self.path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| format!("open ledger lock {}: {e}", path.display()))?;

        FileLock::acquire(file).map_err(|e| format!("lock ledger: {e}"))
    }

    fn write_entry(&self, entry: &Entry) -> Result<(), String> {
        let parent = self.parent_dir()?;
        fs::create_dir_all(&parent).map_err(|e| format!("create ledger directory: {e}"))?;
        append_line(&self.path, entry)
    }

    fn parent_dir(&self) -> Result<PathBuf, String> {
        match self.path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
            Some(parent) => Ok(parent.to_path_buf()),
            None => Err("invalid ledger path".to_string()),
        }
    }
}

/// Held for as long as the value lives; closing the file releases it.
#[derive(Debug)]
struct FileLock {
    _file: File,
}

impl FileLock {
    #[cfg(unix)]
    fn acquire(file: File) -> io::Result<Self> {
        use std::os::fd::AsRawFd;

        loop {
            // SAFETY: the descriptor is owned by `file` and open for the whole call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(not(unix))]
    fn acquire(file: File) -> io::Result<Self> {
        Ok(Self { _file: file })
    }
}

fn append_line(path: &Path, entry: &Entry) -> Result<(), String> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("open {}: {e}", path.display()))?;

    let mut line = serde_json::to_vec(entry).map_err(|e| format!("serialize ledger entry: {e}"))?;
    line.push(b'\n');

    // one write per record so concurrent appenders never interleave lines
    file.write_all(&line)
        .and_then(|_| file.sync_data())
        .map_err(|e| format!("write {}: {e}", path.display()))
}

/// Readable entries of a JSON Lines file; malformed lines are skipped.
fn read_entries(path: &Path) -> io::Result<Vec<Entry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    Ok(BufReader::new(file)
        .split(b'\n')
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_slice::<Entry>(line.trim_ascii()).ok())
        .collect())
}

fn remove_if_exists(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "could not remove spool file");
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("runs"));
    name.push(suffix);
    path.with_file_name(name)
}

fn matches_filter(run: &Run, filter: &Filter) -> bool {
    if let Some(status) = filter.status
        && run.status != status
    {
        return false;
    }

    if let Some(script) = &filter.script
        && !run.script_name.eq_ignore_ascii_case(script)
    {
        return false;
    }

    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
