//! Poll loop orchestration: fetch reports, parse them, persist capped samples.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clockwatch_adapters::{RawSample, SampleAssembler};
use clockwatch_core::{RecordCategory, RecordId};
use clockwatch_storage::{
    insert_with_retry, BackoffPolicy, BoundedRecorder, CategoryHandle, CommandFactSource,
    CommandRunner, CommandSpec, FactSource, JsonFileRecorder, MemoryRecorder,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clockwatch-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    File,
    Memory,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub sources_file: PathBuf,
    pub backoff: BackoffPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            store: StoreKind::File,
            poll_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            sources_file: PathBuf::from("./sources.yaml"),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            data_dir: lookup("CLOCKWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            store: match lookup("CLOCKWATCH_STORE").as_deref().map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("memory") => StoreKind::Memory,
                _ => StoreKind::File,
            },
            poll_interval: secs("CLOCKWATCH_POLL_INTERVAL_SECS", defaults.poll_interval),
            fetch_timeout: secs("CLOCKWATCH_FETCH_TIMEOUT_SECS", defaults.fetch_timeout),
            sources_file: lookup("CLOCKWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            backoff: BackoffPolicy {
                max_retries: lookup("CLOCKWATCH_STORE_MAX_RETRIES")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
        }
    }
}

/// Optional `sources.yaml` overriding the command sampled for each category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactSourceRegistry {
    #[serde(default)]
    pub sources: Vec<FactSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactSourceConfig {
    pub category: RecordCategory,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl FactSourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing fact source registry")
    }

    /// A missing file means "use the default commands"; an unreadable or invalid one is an error.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no fact source registry; using default commands");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn entry(&self, category: RecordCategory) -> Option<&FactSourceConfig> {
        self.sources.iter().rev().find(|s| s.category == category)
    }

    pub fn enabled_categories(&self) -> Vec<RecordCategory> {
        RecordCategory::ALL
            .into_iter()
            .filter(|c| self.entry(*c).map_or(true, |s| s.enabled))
            .collect()
    }

    pub fn build_fact_source(&self, runner: CommandRunner) -> CommandFactSource {
        let mut source = CommandFactSource::with_defaults(runner);
        for config in &self.sources {
            source.set_command(
                config.category,
                CommandSpec::new(config.program.clone(), config.args.clone()),
            );
        }
        source
    }
}

/// Recorder plus the collection handles the poller writes to.
///
/// Opened once at startup and closed on shutdown.
pub struct PollerContext {
    recorder: Arc<dyn BoundedRecorder>,
    handles: BTreeMap<RecordCategory, CategoryHandle>,
}

impl PollerContext {
    pub async fn open(
        recorder: Arc<dyn BoundedRecorder>,
        categories: &[RecordCategory],
    ) -> Result<Self> {
        let mut handles = BTreeMap::new();
        for &category in categories {
            let handle = recorder
                .ensure_category(category)
                .await
                .with_context(|| format!("creating collection `{category}`"))?;
            handles.insert(category, handle);
        }
        Ok(Self { recorder, handles })
    }

    pub async fn open_from_config(
        config: &PollerConfig,
        categories: &[RecordCategory],
    ) -> Result<Self> {
        let recorder: Arc<dyn BoundedRecorder> = match config.store {
            StoreKind::File => Arc::new(JsonFileRecorder::open(&config.data_dir).await?),
            StoreKind::Memory => Arc::new(MemoryRecorder::new()),
        };
        Self::open(recorder, categories).await
    }

    pub fn recorder(&self) -> &Arc<dyn BoundedRecorder> {
        &self.recorder
    }

    pub fn handle(&self, category: RecordCategory) -> Option<&CategoryHandle> {
        self.handles.get(&category)
    }

    pub fn categories(&self) -> Vec<RecordCategory> {
        self.handles.keys().copied().collect()
    }

    pub async fn close(self) -> Result<()> {
        self.recorder.close().await.context("closing recorder")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Parsing,
    Persisting,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollState::Idle => "idle",
            PollState::Fetching => "fetching",
            PollState::Parsing => "parsing",
            PollState::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    pub cycle_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub inserted: BTreeMap<RecordCategory, RecordId>,
    pub skipped: Vec<RecordCategory>,
}

pub struct Poller {
    context: PollerContext,
    sources: Box<dyn FactSource>,
    assembler: SampleAssembler,
    backoff: BackoffPolicy,
    interval: Duration,
    state: PollState,
}

impl Poller {
    pub fn new(context: PollerContext, sources: Box<dyn FactSource>) -> Self {
        let defaults = PollerConfig::default();
        Self {
            context,
            sources,
            assembler: SampleAssembler::new(),
            backoff: defaults.backoff,
            interval: defaults.poll_interval,
            state: PollState::Idle,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn context(&self) -> &PollerContext {
        &self.context
    }

    fn transition(&mut self, next: PollState) {
        debug!(from = %self.state, to = %next, "poll state");
        self.state = next;
    }

    /// One fetch, parse and persist pass over every configured category.
    ///
    /// Per-category failures are logged and reported as skipped; they never
    /// abort the cycle.
    pub async fn run_once(&mut self) -> PollSummary {
        let cycle_id = Uuid::new_v4();
        let categories = self.context.categories();
        let mut skipped = Vec::new();

        self.transition(PollState::Fetching);
        let mut raw = RawSample::new();
        for &category in &categories {
            match self.sources.fetch(category).await {
                Ok(text) => raw.insert(category, text),
                Err(err) => {
                    warn!(%cycle_id, %category, error = %err, "fetch failed; skipping sample");
                    skipped.push(category);
                }
            }
        }

        self.transition(PollState::Parsing);
        let captured_at = Utc::now();
        let records = self.assembler.assemble(&raw, captured_at);

        self.transition(PollState::Persisting);
        let mut inserted = BTreeMap::new();
        for record in records {
            let category = record.category;
            let Some(handle) = self.context.handle(category) else {
                continue;
            };
            let recorder = self.context.recorder().as_ref();
            match insert_with_retry(recorder, handle, &record, &self.backoff).await {
                Ok(id) => {
                    info!(%cycle_id, %category, record_id = %id, "sample inserted");
                    inserted.insert(category, id);
                }
                Err(err) => {
                    error!(
                        %cycle_id,
                        %category,
                        error = %err,
                        "persisting sample failed; skipping"
                    );
                    skipped.push(category);
                }
            }
        }

        self.transition(PollState::Idle);
        PollSummary {
            cycle_id,
            captured_at,
            inserted,
            skipped,
        }
    }

    /// Poll on a fixed interval until `cancel` fires. A cycle in progress
    /// always runs to completion. Returns the number of completed cycles.
    pub async fn run_until_cancelled(&mut self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        info!(interval_secs = self.interval.as_secs_f64(), "poll loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(cycles, "poll loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.run_once().await;
                    cycles += 1;
                    debug!(
                        cycle_id = %summary.cycle_id,
                        inserted = summary.inserted.len(),
                        skipped = summary.skipped.len(),
                        "poll cycle complete"
                    );
                }
            }
        }
        cycles
    }

    pub async fn close(self) -> Result<()> {
        self.context.close().await
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM.
pub fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM; waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn build_poller(config: &PollerConfig) -> Result<Poller> {
    let registry = FactSourceRegistry::load_or_default(&config.sources_file).await?;
    let categories = registry.enabled_categories();
    let context = PollerContext::open_from_config(config, &categories).await?;
    let sources = registry.build_fact_source(CommandRunner::new(config.fetch_timeout));
    Ok(Poller::new(context, Box::new(sources))
        .with_backoff(config.backoff)
        .with_interval(config.poll_interval))
}

pub async fn run_once_from_env() -> Result<PollSummary> {
    let config = PollerConfig::from_env();
    let mut poller = build_poller(&config).await?;
    let summary = poller.run_once().await;
    poller.close().await?;
    Ok(summary)
}

pub async fn run_from_env() -> Result<u64> {
    let config = PollerConfig::from_env();
    let mut poller = build_poller(&config).await?;
    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone());
    let cycles = poller.run_until_cancelled(cancel).await;
    poller.close().await?;
    Ok(cycles)
}
