//! Wiring of watch source, accumulator and dispatcher.
//!
//! ```text
//!   WatchSource --WatchEvent--> assemble() --GranuleRecord--> GranuleProcessor
//!                                 (owns the                    (one task per
//!                                  accumulator)                 granule)
//! ```
//!
//! All accumulator mutation happens inside [`assemble`], which is the only
//! reader of the event queue. Completed granules are processed on their own
//! tasks so a slow pipeline never holds up ingestion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Settings};
use crate::dispatch::{
    DispatchError, DispatchOutcome, Dispatcher, GranuleProcessor, ProcessRunner,
};
use crate::granule::{Arrival, CompletionRule, GranuleAccumulator};
use crate::identity::IdentityExtractor;
use crate::watcher::{WatchError, WatchEvent, build_source};

/// Capacity of the queue between the watch source and the assembly loop.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// How long shutdown waits for dispatches still running.
pub const DISPATCH_GRACE: Duration = Duration::from_secs(30);

type DispatchSet = JoinSet<(String, Result<DispatchOutcome, DispatchError>)>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Watch directory {} does not exist", .0.display())]
    MissingWatchDir(PathBuf),

    #[error("Assembly task failed: {0}")]
    Assembly(#[from] tokio::task::JoinError),
}

/// Counters reported when the assembly loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub events: usize,
    /// Files no pattern classified
    pub rejected: usize,
    pub duplicates: usize,
    pub completed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Dispatches cut off at shutdown
    pub abandoned: usize,
}

pub struct Engine {
    settings: Arc<Settings>,
    extractor: Arc<IdentityExtractor>,
    processor: Arc<dyn GranuleProcessor>,
}

impl Engine {
    /// Engine running the configured external pipeline.
    pub fn new(settings: Arc<Settings>) -> Result<Self, ConfigError> {
        let dispatcher = Dispatcher::from_settings(&settings, Arc::new(ProcessRunner));
        Self::with_processor(settings, Arc::new(dispatcher))
    }

    /// Engine handing completed granules to `processor`.
    pub fn with_processor(
        settings: Arc<Settings>,
        processor: Arc<dyn GranuleProcessor>,
    ) -> Result<Self, ConfigError> {
        let extractor = Arc::new(IdentityExtractor::new(settings.file_type_specs()?));
        Ok(Self {
            settings,
            extractor,
            processor,
        })
    }

    pub fn extractor(&self) -> &IdentityExtractor {
        &self.extractor
    }

    /// A fresh accumulator for the configured completeness rule.
    pub fn accumulator(&self) -> GranuleAccumulator {
        let rule = CompletionRule::types(self.extractor.required_types())
            .with_flags(self.settings.require_ancillary_flags.clone());
        GranuleAccumulator::new(rule, self.settings.pipeline.trigger_type.clone())
    }

    /// Watch `watch_dir` until `shutdown` is cancelled.
    ///
    /// On shutdown the watch source is closed first, then running dispatches
    /// get [`DISPATCH_GRACE`] to finish before they are aborted. Pending,
    /// incomplete granules are dropped.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<AssemblyStats, EngineError> {
        let watch_dir = &self.settings.watch_dir;
        if !watch_dir.is_dir() {
            return Err(EngineError::MissingWatchDir(watch_dir.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut source = build_source(&self.settings, Arc::clone(&self.extractor), tx)?;

        let assembly = tokio::spawn(assemble(
            rx,
            Arc::clone(&self.extractor),
            self.accumulator(),
            Arc::clone(&self.processor),
        ));

        let watched = source.add_watch(watch_dir);
        if watched.is_ok() {
            crate::log_event!(
                "engine",
                "running",
                "{} source on {}",
                source.name(),
                watch_dir.display()
            );
            shutdown.cancelled().await;
            crate::log_event!("engine", "shutting down");
        }

        source.close().await;
        // Dropping the source releases the last event sender.
        drop(source);
        let stats = assembly.await?;
        watched?;

        crate::log_event!(
            "engine",
            "stopped",
            "{} events, {} granules completed",
            stats.events,
            stats.completed
        );
        Ok(stats)
    }
}

/// Single owner of `accumulator`: classify and merge every event until the
/// queue closes, then wait up to [`DISPATCH_GRACE`] for in-flight dispatches.
pub async fn assemble(
    events: mpsc::Receiver<WatchEvent>,
    extractor: Arc<IdentityExtractor>,
    accumulator: GranuleAccumulator,
    processor: Arc<dyn GranuleProcessor>,
) -> AssemblyStats {
    assemble_with_grace(events, extractor, accumulator, processor, DISPATCH_GRACE).await
}

/// [`assemble`] with an explicit shutdown grace for running dispatches.
pub async fn assemble_with_grace(
    mut events: mpsc::Receiver<WatchEvent>,
    extractor: Arc<IdentityExtractor>,
    mut accumulator: GranuleAccumulator,
    processor: Arc<dyn GranuleProcessor>,
    grace: Duration,
) -> AssemblyStats {
    let mut stats = AssemblyStats::default();
    let mut dispatches = DispatchSet::new();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Some(event) => {
                    stats.events += 1;
                    accept_event(&event, &extractor, &mut accumulator, &processor, &mut dispatches, &mut stats);
                }
                None => break,
            },

            Some(joined) = dispatches.join_next() => record_dispatch(joined, &mut stats),
        }
    }

    drain_dispatches(&mut dispatches, &mut stats, grace).await;
    if accumulator.pending_count() > 0 {
        crate::log_event!(
            "assembly",
            "dropped",
            "{} incomplete granules",
            accumulator.pending_count()
        );
    }
    stats
}

/// Collect running dispatches for up to `grace`, then abort the rest.
async fn drain_dispatches(dispatches: &mut DispatchSet, stats: &mut AssemblyStats, grace: Duration) {
    if dispatches.is_empty() {
        return;
    }
    crate::log_event!("assembly", "waiting", "{} dispatches", dispatches.len());

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = dispatches.join_next().await {
            record_dispatch(joined, &mut *stats);
        }
    })
    .await;

    if drained.is_err() {
        stats.abandoned = dispatches.len();
        tracing::warn!(
            "[assembly] aborting {} dispatches still running after {}s",
            stats.abandoned,
            grace.as_secs_f32()
        );
        dispatches.abort_all();
        while dispatches.join_next().await.is_some() {}
    }
}

fn accept_event(
    event: &WatchEvent,
    extractor: &IdentityExtractor,
    accumulator: &mut GranuleAccumulator,
    processor: &Arc<dyn GranuleProcessor>,
    dispatches: &mut DispatchSet,
    stats: &mut AssemblyStats,
) {
    let class = match extractor.classify_path(&event.path) {
        Ok(class) => class,
        Err(e) => {
            stats.rejected += 1;
            tracing::warn!("[assembly] {e}");
            return;
        }
    };

    match accumulator.accept(&class.type_name, &class.granule_id, &event.path) {
        Ok(Arrival::Pending { id, missing }) => {
            crate::debug_event!(
                "assembly",
                "pending",
                "{id} +{} ({} missing)",
                class.type_name,
                missing.len()
            );
        }
        Ok(Arrival::Complete(record)) => {
            stats.completed += 1;
            crate::log_event!("assembly", "complete", "{}", record.id);
            let processor = Arc::clone(processor);
            dispatches.spawn(async move {
                let id = record.id.clone();
                (id, processor.process(record).await)
            });
        }
        Err(e) if e.is_benign() => {
            stats.duplicates += 1;
            crate::debug_event!("assembly", "duplicate", "{e}");
        }
        Err(e) => tracing::error!("[assembly] {e}"),
    }
}

fn record_dispatch(
    joined: Result<(String, Result<DispatchOutcome, DispatchError>), tokio::task::JoinError>,
    stats: &mut AssemblyStats,
) {
    match joined {
        Ok((_, Ok(DispatchOutcome::Processed { .. }))) => stats.processed += 1,
        Ok((_, Ok(DispatchOutcome::Skipped { .. }))) => stats.skipped += 1,
        Ok((id, Err(DispatchError::StageFailed { reason, output, stage, .. }))) => {
            stats.failed += 1;
            tracing::error!("[dispatch] {stage} failed for {id}: {reason}\n{output}");
        }
        Ok((id, Err(e))) => {
            stats.failed += 1;
            tracing::error!("[dispatch] {id}: {e}");
        }
        Err(e) => {
            stats.failed += 1;
            tracing::error!("[dispatch] task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommandOutput, CommandRunner};
    use crate::granule::GranuleRecord;
    use async_trait::async_trait;
    use std::ffi::OsString;
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    const VIIRS: [&str; 11] = [
        "GMTCO", "IICMO", "SVDNB", "SVM07", "SVM08", "SVM10", "SVM12", "SVM13", "SVM14", "SVM15",
        "SVM16",
    ];

    fn file_for(type_name: &str, id: &str) -> WatchEvent {
        WatchEvent::new(format!("/in/{type_name}_{id}_c20240101_noac_ops.h5"))
    }

    #[derive(Default)]
    struct CollectingProcessor {
        seen: Mutex<Vec<GranuleRecord>>,
    }

    #[async_trait]
    impl GranuleProcessor for CollectingProcessor {
        async fn process(&self, record: GranuleRecord) -> Result<DispatchOutcome, DispatchError> {
            self.seen.lock().unwrap().push(record);
            Ok(DispatchOutcome::Processed {
                detect_output: PathBuf::from("det.csv"),
                fit_output: PathBuf::from("fit.csv"),
            })
        }
    }

    fn engine(processor: Arc<dyn GranuleProcessor>) -> Engine {
        Engine::with_processor(Arc::new(Settings::default()), processor).unwrap()
    }

    #[tokio::test]
    async fn test_eleven_types_dispatch_once() {
        let processor = Arc::new(CollectingProcessor::default());
        let engine = engine(processor.clone());
        let (tx, rx) = mpsc::channel(64);

        let id = "npp_d20240101_t0100000_e0101000";
        for t in VIIRS {
            tx.send(file_for(t, id)).await.unwrap();
        }
        // Late duplicates of already-satisfied types
        tx.send(file_for("SVM10", id)).await.unwrap();
        tx.send(file_for("GMTCO", id)).await.unwrap();
        tx.send(WatchEvent::new("/in/readme.txt")).await.unwrap();
        drop(tx);

        let stats = assemble(
            rx,
            Arc::new(engine.extractor().clone()),
            engine.accumulator(),
            processor.clone(),
        )
        .await;

        let seen = processor.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, id);
        assert_eq!(seen[0].satisfied_types.len(), 11);
        assert_eq!(
            seen[0].trigger_file,
            Some(PathBuf::from(format!(
                "/in/SVM10_{id}_c20240101_noac_ops.h5"
            )))
        );
        assert_eq!(stats.events, 14);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_incomplete_granule_is_never_dispatched() {
        let processor = Arc::new(CollectingProcessor::default());
        let engine = engine(processor.clone());
        let (tx, rx) = mpsc::channel(64);

        for t in &VIIRS[..10] {
            tx.send(file_for(t, "a_b_c_d")).await.unwrap();
        }
        tx.send(file_for("SVM07", "a_b_c_d")).await.unwrap();
        drop(tx);

        let stats = assemble(
            rx,
            Arc::new(engine.extractor().clone()),
            engine.accumulator(),
            processor.clone(),
        )
        .await;

        assert!(processor.seen.lock().unwrap().is_empty());
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.completed, 0);
    }

    /// Blocks the first granule until the second one has been processed.
    struct OrderedProcessor {
        release: Semaphore,
        finished: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GranuleProcessor for OrderedProcessor {
        async fn process(&self, record: GranuleRecord) -> Result<DispatchOutcome, DispatchError> {
            if record.id == "slow_g_1_1" {
                let _permit = self.release.acquire().await;
            } else {
                self.release.add_permits(1);
            }
            self.finished.lock().unwrap().push(record.id.clone());
            Ok(DispatchOutcome::Skipped {
                reason: "test".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_slow_dispatch_does_not_block_other_granules() {
        let processor = Arc::new(OrderedProcessor {
            release: Semaphore::new(0),
            finished: Mutex::new(Vec::new()),
        });
        let engine = engine(processor.clone());
        let (tx, rx) = mpsc::channel(64);

        for t in VIIRS {
            tx.send(file_for(t, "slow_g_1_1")).await.unwrap();
        }
        for t in VIIRS {
            tx.send(file_for(t, "fast_g_2_2")).await.unwrap();
        }
        drop(tx);

        let stats = timeout(
            Duration::from_secs(5),
            assemble(
                rx,
                Arc::new(engine.extractor().clone()),
                engine.accumulator(),
                processor.clone(),
            ),
        )
        .await
        .expect("dispatch of one granule blocked another");

        assert_eq!(stats.skipped, 2);
        assert_eq!(
            *processor.finished.lock().unwrap(),
            vec!["fast_g_2_2".to_string(), "slow_g_1_1".to_string()]
        );
    }

    /// Never finishes.
    struct HungProcessor;

    #[async_trait]
    impl GranuleProcessor for HungProcessor {
        async fn process(&self, _record: GranuleRecord) -> Result<DispatchOutcome, DispatchError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_hung_dispatch_after_grace() {
        let engine = engine(Arc::new(HungProcessor));
        let (tx, rx) = mpsc::channel(64);
        for t in VIIRS {
            tx.send(file_for(t, "hung_g_1_1")).await.unwrap();
        }
        drop(tx);

        let stats = timeout(
            Duration::from_secs(5),
            assemble_with_grace(
                rx,
                Arc::new(engine.extractor().clone()),
                engine.accumulator(),
                Arc::new(HungProcessor),
                Duration::from_millis(100),
            ),
        )
        .await
        .expect("shutdown waited on a hung dispatch");

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.processed + stats.skipped + stats.failed, 0);
    }

    /// Every tool succeeds with empty output; invocations are recorded.
    #[derive(Default)]
    struct ToolLog {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandRunner for ToolLog {
        async fn run(&self, program: &Path, args: &[OsString]) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push((
                program.display().to_string(),
                args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            ));
            Ok(CommandOutput {
                success: true,
                code: Some(0),
                ..CommandOutput::default()
            })
        }
    }

    #[tokio::test]
    async fn test_complete_granule_runs_gate_detect_fit_once() {
        let out = TempDir::new().unwrap();
        let settings = Settings {
            output_dir: out.path().to_path_buf(),
            ..Settings::default()
        };
        let tools = Arc::new(ToolLog::default());
        let dispatcher = Dispatcher::from_settings(&settings, tools.clone());
        let engine = Engine::with_processor(Arc::new(settings), Arc::new(dispatcher)).unwrap();

        let id = "npp_d20240101_t0100000_e0101000";
        let (tx, rx) = mpsc::channel(64);
        for t in VIIRS {
            tx.send(file_for(t, id)).await.unwrap();
        }
        tx.send(file_for("SVM10", id)).await.unwrap();
        drop(tx);

        let stats = assemble(
            rx,
            Arc::new(engine.extractor().clone()),
            engine.accumulator(),
            Arc::clone(&engine.processor),
        )
        .await;
        assert_eq!(stats.processed, 1);

        let trigger = format!("/in/SVM10_{id}_c20240101_noac_ops.h5");
        let detect_csv = out.path().join(format!("VNFD_{id}_v2.1.csv")).display().to_string();
        let fit_csv = out.path().join(format!("VNFL_{id}_v2.1.csv")).display().to_string();

        let calls = tools.calls.lock().unwrap();
        let programs: Vec<&str> = calls.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(programs, vec!["h5dump", "vnf_detect", "vnf_fit"]);
        assert_eq!(calls[0].1, vec!["-x".to_string(), "-A".to_string(), trigger.clone()]);
        assert_eq!(calls[1].1[..3], [trigger, "-output".to_string(), detect_csv.clone()]);
        assert_eq!(calls[2].1[..3], [detect_csv, "-output".to_string(), fit_csv]);
    }

    #[tokio::test]
    async fn test_run_requires_existing_watch_dir() {
        let settings = Settings {
            watch_dir: PathBuf::from("/definitely/not/here"),
            ..Settings::default()
        };
        let engine = Engine::with_processor(
            Arc::new(settings),
            Arc::new(CollectingProcessor::default()),
        )
        .unwrap();

        let result = engine.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::MissingWatchDir(_))));
    }
}
