//! Capped record storage + fact-source command utilities for clockwatch.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clockwatch_core::{Record, RecordCategory, RecordId, CATEGORY_CAPACITY};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clockwatch-storage";

/// A record as held by a recorder, with the id handed back on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub inserted_at: DateTime<Utc>,
    pub record: Record,
}

/// Fixed-capacity, insertion-ordered buffer; pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct CappedCollection {
    capacity: usize,
    records: VecDeque<StoredRecord>,
}

impl CappedCollection {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuild from previously persisted records, keeping only the newest `capacity`.
    pub fn from_records(capacity: usize, records: Vec<StoredRecord>) -> Self {
        let mut collection = Self::new(capacity);
        for record in records {
            collection.push(record);
        }
        collection
    }

    pub fn push(&mut self, record: StoredRecord) -> Option<StoredRecord> {
        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_vec(&self) -> Vec<StoredRecord> {
        self.records.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryHandle {
    pub category: RecordCategory,
    pub name: String,
    pub capacity: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("collection `{0}` has not been created")]
    UnknownCategory(RecordCategory),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing collection `{category}`: {source}")]
    Serialize {
        category: RecordCategory,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt collection file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_storage_error(err: &StorageError) -> RetryDisposition {
    match err {
        StorageError::Io { .. } => RetryDisposition::Retryable,
        StorageError::UnknownCategory(_)
        | StorageError::Serialize { .. }
        | StorageError::Corrupt { .. } => RetryDisposition::NonRetryable,
    }
}

/// Fixed-capacity store with one collection per record category.
#[async_trait]
pub trait BoundedRecorder: Send + Sync {
    /// Create the category's collection if absent. Idempotent.
    async fn ensure_category(
        &self,
        category: RecordCategory,
    ) -> Result<CategoryHandle, StorageError>;

    /// Append a record, evicting the oldest one when the collection is full.
    async fn insert(
        &self,
        handle: &CategoryHandle,
        record: Record,
    ) -> Result<RecordId, StorageError>;

    async fn snapshot(&self, handle: &CategoryHandle) -> Result<Vec<StoredRecord>, StorageError>;

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn stored(record: Record) -> StoredRecord {
    StoredRecord {
        id: Uuid::new_v4(),
        inserted_at: Utc::now(),
        record,
    }
}

fn handle_for(category: RecordCategory, capacity: usize) -> CategoryHandle {
    CategoryHandle {
        category,
        name: category.collection_name().to_string(),
        capacity,
    }
}

#[derive(Debug)]
pub struct MemoryRecorder {
    capacity: usize,
    collections: Mutex<HashMap<RecordCategory, CappedCollection>>,
}

impl Default for MemoryRecorder {
    fn default() -> Self {
        Self::with_capacity(CATEGORY_CAPACITY)
    }
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            collections: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BoundedRecorder for MemoryRecorder {
    async fn ensure_category(
        &self,
        category: RecordCategory,
    ) -> Result<CategoryHandle, StorageError> {
        let mut collections = self.collections.lock().await;
        if !collections.contains_key(&category) {
            collections.insert(category, CappedCollection::new(self.capacity));
            info!(collection = %category, capacity = self.capacity, "created capped collection");
        }
        Ok(handle_for(category, self.capacity))
    }

    async fn insert(
        &self,
        handle: &CategoryHandle,
        record: Record,
    ) -> Result<RecordId, StorageError> {
        let mut collections = self.collections.lock().await;
        let collection = collections
            .get_mut(&handle.category)
            .ok_or(StorageError::UnknownCategory(handle.category))?;
        let entry = stored(record);
        let id = entry.id;
        if let Some(evicted) = collection.push(entry) {
            debug!(collection = %handle.category, evicted = %evicted.id, "evicted oldest record");
        }
        Ok(id)
    }

    async fn snapshot(&self, handle: &CategoryHandle) -> Result<Vec<StoredRecord>, StorageError> {
        let collections = self.collections.lock().await;
        collections
            .get(&handle.category)
            .map(CappedCollection::to_vec)
            .ok_or(StorageError::UnknownCategory(handle.category))
    }
}

/// Recorder that keeps each collection as a JSON array file under `root`.
///
/// Every insert rewrites the category file through a temp file and an atomic
/// rename, so a crash never leaves a half-written collection behind.
#[derive(Debug)]
pub struct JsonFileRecorder {
    root: PathBuf,
    capacity: usize,
    collections: Mutex<HashMap<RecordCategory, CappedCollection>>,
}

impl JsonFileRecorder {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::open_with_capacity(root, CATEGORY_CAPACITY).await
    }

    pub async fn open_with_capacity(
        root: impl Into<PathBuf>,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating data directory {}", root.display()))?;
        Ok(Self {
            root,
            capacity: capacity.max(1),
            collections: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, category: RecordCategory) -> PathBuf {
        self.root.join(format!("{}.json", category.collection_name()))
    }

    async fn load_collection(
        &self,
        category: RecordCategory,
    ) -> Result<Option<CappedCollection>, StorageError> {
        let path = self.collection_path(category);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let records: Vec<StoredRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?;
        Ok(Some(CappedCollection::from_records(self.capacity, records)))
    }

    async fn write_collection(
        &self,
        category: RecordCategory,
        collection: &CappedCollection,
    ) -> Result<(), StorageError> {
        let path = self.collection_path(category);
        let bytes = serde_json::to_vec_pretty(&collection.to_vec())
            .map_err(|source| StorageError::Serialize { category, source })?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", category.collection_name(), Uuid::new_v4()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io { path, source });
        }
        Ok(())
    }
}

#[async_trait]
impl BoundedRecorder for JsonFileRecorder {
    async fn ensure_category(
        &self,
        category: RecordCategory,
    ) -> Result<CategoryHandle, StorageError> {
        let mut collections = self.collections.lock().await;
        if !collections.contains_key(&category) {
            let collection = match self.load_collection(category).await? {
                Some(existing) => {
                    info!(
                        collection = %category,
                        records = existing.len(),
                        "loaded capped collection"
                    );
                    existing
                }
                None => {
                    let fresh = CappedCollection::new(self.capacity);
                    self.write_collection(category, &fresh).await?;
                    info!(
                        collection = %category,
                        capacity = self.capacity,
                        "created capped collection"
                    );
                    fresh
                }
            };
            collections.insert(category, collection);
        }
        Ok(handle_for(category, self.capacity))
    }

    async fn insert(
        &self,
        handle: &CategoryHandle,
        record: Record,
    ) -> Result<RecordId, StorageError> {
        let mut collections = self.collections.lock().await;
        let current = collections
            .get(&handle.category)
            .ok_or(StorageError::UnknownCategory(handle.category))?;

        // In-memory state changes only after the file write succeeds.
        let mut next = current.clone();
        let entry = stored(record);
        let id = entry.id;
        let evicted = next.push(entry);
        self.write_collection(handle.category, &next).await?;
        collections.insert(handle.category, next);

        if let Some(evicted) = evicted {
            debug!(collection = %handle.category, evicted = %evicted.id, "evicted oldest record");
        }
        Ok(id)
    }

    async fn snapshot(&self, handle: &CategoryHandle) -> Result<Vec<StoredRecord>, StorageError> {
        let collections = self.collections.lock().await;
        collections
            .get(&handle.category)
            .map(CappedCollection::to_vec)
            .ok_or(StorageError::UnknownCategory(handle.category))
    }

    async fn close(&self) -> Result<(), StorageError> {
        let collections = self.collections.lock().await;
        for (category, collection) in collections.iter() {
            self.write_collection(*category, collection).await?;
        }
        debug!(root = %self.root.display(), "flushed collections on close");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Insert with bounded exponential backoff on retryable failures.
pub async fn insert_with_retry(
    recorder: &dyn BoundedRecorder,
    handle: &CategoryHandle,
    record: &Record,
    backoff: &BackoffPolicy,
) -> Result<RecordId, StorageError> {
    let mut attempt = 0usize;
    loop {
        match recorder.insert(handle, record.clone()).await {
            Ok(id) => return Ok(id),
            Err(err) => {
                let disposition = classify_storage_error(&err);
                if disposition == RetryDisposition::Retryable && attempt < backoff.max_retries {
                    warn!(
                        collection = %handle.category,
                        attempt,
                        error = %err,
                        "insert failed; backing off"
                    );
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// External command producing the raw text of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Commands the daemon is sampled with when no registry overrides them.
pub fn default_command(category: RecordCategory) -> CommandSpec {
    match category {
        RecordCategory::Tracking => CommandSpec::new("chronyc", ["tracking"]),
        RecordCategory::Client => CommandSpec::new("sudo", ["chronyc", "clients"]),
        RecordCategory::Time => CommandSpec::new("timedatectl", ["status"]),
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("no fact source configured for `{0}`")]
    Unconfigured(RecordCategory),
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the command to completion and return its stdout.
    ///
    /// The child is killed if it outlives the runner's timeout.
    pub async fn run(&self, spec: &CommandSpec) -> Result<String, FetchError> {
        let command = spec.to_string();
        let span = info_span!("fact_fetch", command = %command);

        async move {
            let child = Command::new(&spec.program)
                .args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| FetchError::Spawn {
                    command: command.clone(),
                    source,
                })?;

            let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|source| FetchError::Spawn {
                    command: command.clone(),
                    source,
                })?,
                Err(_) => {
                    return Err(FetchError::Timeout {
                        command,
                        timeout: self.timeout,
                    })
                }
            };

            if !output.status.success() {
                return Err(FetchError::NonZeroExit {
                    command,
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            let text = String::from_utf8_lossy(&output.stdout).into_owned();
            debug!(bytes = text.len(), "fact source returned");
            Ok(text)
        }
        .instrument(span)
        .await
    }
}

/// Producer of raw report text for one category.
#[async_trait]
pub trait FactSource: Send + Sync {
    async fn fetch(&self, category: RecordCategory) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CommandFactSource {
    runner: CommandRunner,
    commands: HashMap<RecordCategory, CommandSpec>,
}

impl CommandFactSource {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            commands: HashMap::new(),
        }
    }

    pub fn with_defaults(runner: CommandRunner) -> Self {
        let mut source = Self::new(runner);
        for category in RecordCategory::ALL {
            source.set_command(category, default_command(category));
        }
        source
    }

    pub fn set_command(&mut self, category: RecordCategory, spec: CommandSpec) {
        self.commands.insert(category, spec);
    }

    pub fn command_for(&self, category: RecordCategory) -> Option<&CommandSpec> {
        self.commands.get(&category)
    }
}

#[async_trait]
impl FactSource for CommandFactSource {
    async fn fetch(&self, category: RecordCategory) -> Result<String, FetchError> {
        let spec = self
            .commands
            .get(&category)
            .ok_or(FetchError::Unconfigured(category))?;
        self.runner.run(spec).await
    }
}
