// The capture-generate-print state machine. One cycle per accepted
// trigger; the device services a single cycle at a time and drops
// presses that arrive while one is running.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::artifact::{CaptureArtifact, PoemResult};
use crate::camera::ImageCapture;
use crate::config::PipelineConfig;
use crate::cycle::{Cycle, FailureReason, Stage};
use crate::errors::{AppError, AppResult, CaptureError, DatabaseError, GenerationError, PrintError};
use crate::generator::PoemGenerator;
use crate::printers::{PrintJob, Printer};
use crate::storage::ArtifactStore;
use crate::style::StyleDirective;
use crate::trigger::TriggerEvent;

const APOLOGY_NOTICE: &str =
    "No poem arrived for this photograph. The image is saved; please press the button again.";

/// Per-stage wall-clock budgets. A hung collaborator must not hang the
/// device.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub capture: Duration,
    pub generation: Duration,
    pub print: Duration,
}

impl From<&PipelineConfig> for StageTimeouts {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            capture: config.capture_timeout(),
            generation: config.generation_timeout(),
            print: config.print_timeout(),
        }
    }
}

/// Retry budgets are per stage, never global: a cycle that fails one
/// stage is terminal, not restarted from the top.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub generation_attempts: u32,
    pub print_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub print_retry_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for generation retries: base * 2^n, capped.
    pub fn backoff_delay(&self, retries_used: u32) -> Duration {
        let base_ms = self.backoff_base.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.backoff_max.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            generation_attempts: config.generation_attempts,
            print_attempts: config.print_attempts,
            backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
            print_retry_delay: Duration::from_millis(config.print_retry_delay_ms),
        }
    }
}

pub struct Orchestrator {
    camera: Arc<dyn ImageCapture>,
    generator: Arc<dyn PoemGenerator>,
    printer: Arc<dyn Printer>,
    store: ArtifactStore,
    pool: SqlitePool,
    style: Arc<StyleDirective>,
    timeouts: StageTimeouts,
    retry: RetryPolicy,
    apology_slip: bool,
    busy: AtomicBool,
    stage: Mutex<Stage>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Arc<dyn ImageCapture>,
        generator: Arc<dyn PoemGenerator>,
        printer: Arc<dyn Printer>,
        store: ArtifactStore,
        pool: SqlitePool,
        style: Arc<StyleDirective>,
        timeouts: StageTimeouts,
        retry: RetryPolicy,
        apology_slip: bool,
    ) -> Self {
        Self {
            camera,
            generator,
            printer,
            store,
            pool,
            style,
            timeouts,
            retry,
            apology_slip,
            busy: AtomicBool::new(false),
            stage: Mutex::new(Stage::Idle),
        }
    }

    /// Device-level stage: `Idle` between cycles, otherwise the stage
    /// of the active cycle.
    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap()
    }

    fn set_stage(&self, stage: Stage) {
        *self.stage.lock().unwrap() = stage;
    }

    /// Service triggers until the source closes. One cycle at a time;
    /// presses that landed while a cycle ran are stale and dropped.
    pub async fn run(&self, mut triggers: mpsc::Receiver<TriggerEvent>) {
        info!("System ready for operation");
        while let Some(event) = triggers.recv().await {
            debug!(pressed_at = %event.pressed_at, "trigger received");
            self.on_trigger().await;

            let mut dropped = 0usize;
            while triggers.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(dropped, "dropped triggers received while busy");
            }
        }
        info!("Trigger source closed, run loop exiting");
    }

    /// Accept one trigger. Returns the terminal cycle record, or `None`
    /// when the trigger was dropped because a cycle was already active.
    pub async fn on_trigger(&self) -> Option<Cycle> {
        if self.busy.swap(true, Ordering::SeqCst) {
            warn!("trigger ignored: a cycle is already in progress");
            return None;
        }

        let serial = match Cycle::count(&self.pool).await {
            Ok(count) => count + 1,
            Err(e) => {
                error!(error = %e, "could not read cycle archive for serial numbering");
                1
            }
        };

        let mut cycle = Cycle::new(serial);
        info!(cycle_id = %cycle.id, serial, "trigger accepted, cycle started");
        self.set_stage(Stage::Capturing);
        if let Err(e) = cycle.save(&self.pool).await {
            error!(cycle_id = %cycle.id, error = %e, "failed to archive new cycle record");
        }

        self.run_cycle(&mut cycle).await;

        self.set_stage(Stage::Idle);
        self.busy.store(false, Ordering::SeqCst);
        Some(cycle)
    }

    /// Re-run generation and printing against the persisted artifact of
    /// an archived cycle. Recovery path for cycles that failed after
    /// the durability point; no re-capture involved.
    pub async fn regenerate(&self, cycle_id: Uuid) -> AppResult<Cycle> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(AppError::Busy);
        }
        let result = self.regenerate_inner(cycle_id).await;
        self.set_stage(Stage::Idle);
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn regenerate_inner(&self, cycle_id: Uuid) -> AppResult<Cycle> {
        let mut cycle = Cycle::load(cycle_id, &self.pool)
            .await?
            .ok_or_else(|| DatabaseError::CycleNotFound {
                id: cycle_id.to_string(),
            })?;

        let data = self.store.load_image(cycle_id).await?;
        let artifact = CaptureArtifact::new(cycle_id, data);
        info!(cycle_id = %cycle_id, "reprocessing persisted artifact");

        // A fresh pass over an archived cycle: clear the terminal state
        // and resume from the generation stage.
        cycle.outcome = None;
        cycle.stage = Stage::Generating;
        cycle.stage_entered_at = Utc::now();
        self.set_stage(Stage::Generating);
        self.update_record(&cycle).await;

        self.generate_and_print(&mut cycle, &artifact).await;
        Ok(cycle)
    }

    async fn run_cycle(&self, cycle: &mut Cycle) {
        let Some(artifact) = self.capture_stage(cycle).await else {
            return;
        };
        self.generate_and_print(cycle, &artifact).await;
    }

    async fn capture_stage(&self, cycle: &mut Cycle) -> Option<CaptureArtifact> {
        cycle.capture_attempts = 1;
        let result = match timeout(self.timeouts.capture, self.camera.capture()).await {
            Err(_) => Err(CaptureError::Timeout(self.timeouts.capture)),
            Ok(result) => result,
        };

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                // No capture retry: the moment has passed, a fresh
                // press is the recovery path.
                self.fail(cycle, FailureReason::Capture, &e).await;
                return None;
            }
        };

        // Durability point: the photo must be on disk before the cycle
        // moves past the capture stage.
        let artifact = CaptureArtifact::new(cycle.id, data);
        match self.store.save_image(&artifact).await {
            Ok(path) => {
                cycle.image_path = Some(path.display().to_string());
            }
            Err(e) => {
                error!(cycle_id = %cycle.id, error = %e, "captured image could not be persisted");
                self.fail(cycle, FailureReason::Capture, &e).await;
                return None;
            }
        }

        self.enter(cycle, Stage::Generating).await;
        Some(artifact)
    }

    async fn generate_and_print(&self, cycle: &mut Cycle, artifact: &CaptureArtifact) {
        let Some(poem) = self.generation_stage(cycle, artifact).await else {
            return;
        };

        // The poem is durable before the first print attempt; a print
        // failure cannot lose it.
        match self.store.save_poem(&poem).await {
            Ok(path) => {
                cycle.poem_path = Some(path.display().to_string());
            }
            Err(e) => {
                error!(
                    cycle_id = %cycle.id,
                    error = %e,
                    "generated poem could not be persisted, printing anyway"
                );
            }
        }

        self.enter(cycle, Stage::Printing).await;
        self.print_stage(cycle, &poem).await;
    }

    async fn generation_stage(
        &self,
        cycle: &mut Cycle,
        artifact: &CaptureArtifact,
    ) -> Option<PoemResult> {
        let budget = self.retry.generation_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            cycle.generation_attempts += 1;

            let result = match timeout(
                self.timeouts.generation,
                self.generator.generate(artifact, &self.style),
            )
            .await
            {
                Err(_) => Err(GenerationError::Timeout(self.timeouts.generation)),
                Ok(result) => result,
            };

            let err = match result.and_then(|text| PoemResult::new(cycle.id, text)) {
                Ok(poem) => return Some(poem),
                Err(e) => e,
            };

            if attempt >= budget {
                self.fail(cycle, FailureReason::Generation, &err).await;
                if self.apology_slip {
                    self.print_apology().await;
                }
                return None;
            }

            let delay = self.retry.backoff_delay(attempt - 1);
            warn!(
                cycle_id = %cycle.id,
                error = %err,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "generation attempt failed, retrying"
            );
            sleep(delay).await;
        }
    }

    async fn print_stage(&self, cycle: &mut Cycle, poem: &PoemResult) {
        let budget = self.retry.print_attempts.max(1);
        let job = self.build_job(cycle, poem);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            cycle.print_attempts += 1;

            let result = match timeout(self.timeouts.print, self.printer.print_poem(&job)).await {
                Err(_) => Err(PrintError::Timeout(self.timeouts.print)),
                Ok(result) => result,
            };

            match result {
                Ok(()) => {
                    cycle.complete();
                    self.set_stage(Stage::Done);
                    self.update_record(cycle).await;
                    info!(
                        cycle_id = %cycle.id,
                        serial = cycle.serial,
                        "cycle complete, poem printed"
                    );
                    return;
                }
                Err(e) if attempt >= budget => {
                    self.fail(cycle, FailureReason::Print, &e).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        cycle_id = %cycle.id,
                        error = %e,
                        attempt,
                        "print attempt failed, retrying"
                    );
                    sleep(self.retry.print_retry_delay).await;
                }
            }
        }
    }

    async fn print_apology(&self) {
        match timeout(self.timeouts.print, self.printer.print_notice(APOLOGY_NOTICE)).await {
            Ok(Ok(())) => info!("apology slip printed"),
            Ok(Err(e)) => warn!(error = %e, "apology slip failed"),
            Err(_) => warn!("apology slip timed out"),
        }
    }

    fn build_job(&self, cycle: &Cycle, poem: &PoemResult) -> PrintJob {
        let id = cycle.id.to_string();
        let short = &id[..8];
        PrintJob {
            serial: cycle.serial,
            image_name: file_name_or(cycle.image_path.as_deref(), &format!("{short}.jpg")),
            poem_name: file_name_or(cycle.poem_path.as_deref(), &format!("{short}.txt")),
            body: poem.text().to_string(),
        }
    }

    async fn enter(&self, cycle: &mut Cycle, stage: Stage) {
        cycle.advance(stage);
        self.set_stage(stage);
        self.update_record(cycle).await;
    }

    async fn fail(&self, cycle: &mut Cycle, reason: FailureReason, err: &(dyn fmt::Display + Send + Sync)) {
        warn!(cycle_id = %cycle.id, reason = %reason, error = %err, "cycle failed");
        cycle.fail(reason);
        self.set_stage(Stage::Failed);
        self.update_record(cycle).await;
    }

    async fn update_record(&self, cycle: &Cycle) {
        if let Err(e) = cycle.update(&self.pool).await {
            error!(cycle_id = %cycle.id, error = %e, "failed to update cycle archive record");
        }
    }
}

fn file_name_or(path: Option<&str>, fallback: &str) -> String {
    path.and_then(|p| Path::new(p).file_name())
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::Outcome;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    const TEST_JPEG: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0x03, 0xFF, 0xD9];

    struct StaticCamera;

    #[async_trait]
    impl ImageCapture for StaticCamera {
        async fn capture(&self) -> Result<Bytes, CaptureError> {
            Ok(Bytes::from_static(TEST_JPEG))
        }

        async fn check_connection(&self) -> bool {
            true
        }

        fn type_name(&self) -> &'static str {
            "static test camera"
        }
    }

    struct FailingCamera;

    #[async_trait]
    impl ImageCapture for FailingCamera {
        async fn capture(&self) -> Result<Bytes, CaptureError> {
            Err(CaptureError::DeviceUnavailable("unplugged".to_string()))
        }

        async fn check_connection(&self) -> bool {
            false
        }

        fn type_name(&self) -> &'static str {
            "failing test camera"
        }
    }

    struct SlowCamera(Duration);

    #[async_trait]
    impl ImageCapture for SlowCamera {
        async fn capture(&self) -> Result<Bytes, CaptureError> {
            sleep(self.0).await;
            Ok(Bytes::from_static(TEST_JPEG))
        }

        async fn check_connection(&self) -> bool {
            true
        }

        fn type_name(&self) -> &'static str {
            "slow test camera"
        }
    }

    struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<String, GenerationError>>>,
        calls: AtomicU32,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn push(&self, outcome: Result<String, GenerationError>) {
            self.script.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PoemGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _artifact: &CaptureArtifact,
            _style: &StyleDirective,
        ) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("a test haiku".to_string()))
        }

        fn type_name(&self) -> &'static str {
            "scripted test generator"
        }
    }

    struct SlowGenerator(Duration);

    #[async_trait]
    impl PoemGenerator for SlowGenerator {
        async fn generate(
            &self,
            _artifact: &CaptureArtifact,
            _style: &StyleDirective,
        ) -> Result<String, GenerationError> {
            sleep(self.0).await;
            Ok("a slow haiku".to_string())
        }

        fn type_name(&self) -> &'static str {
            "slow test generator"
        }
    }

    struct ScriptedPrinter {
        fail_first: u32,
        attempts: AtomicU32,
        jobs: Mutex<Vec<PrintJob>>,
        notices: Mutex<Vec<String>>,
    }

    impl ScriptedPrinter {
        fn succeeding() -> Arc<Self> {
            Self::failing_first(0)
        }

        fn failing_first(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                attempts: AtomicU32::new(0),
                jobs: Mutex::new(Vec::new()),
                notices: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Printer for ScriptedPrinter {
        async fn print_poem(&self, job: &PrintJob) -> Result<(), PrintError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                return Err(PrintError::Jam("test jam".to_string()));
            }
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }

        async fn print_notice(&self, text: &str) -> Result<(), PrintError> {
            self.notices.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            true
        }

        fn type_name(&self) -> &'static str {
            "scripted test printer"
        }
    }

    struct TestRig {
        orchestrator: Arc<Orchestrator>,
        store: ArtifactStore,
        pool: SqlitePool,
    }

    async fn test_pool() -> SqlitePool {
        // A pooled in-memory SQLite gives each connection its own
        // database; pin the pool to one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    fn fast_timeouts() -> StageTimeouts {
        StageTimeouts {
            capture: ms(250),
            generation: ms(250),
            print: ms(250),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            generation_attempts: 3,
            print_attempts: 2,
            backoff_base: ms(1),
            backoff_max: ms(4),
            print_retry_delay: ms(1),
        }
    }

    async fn rig_with(
        camera: Arc<dyn ImageCapture>,
        generator: Arc<dyn PoemGenerator>,
        printer: Arc<dyn Printer>,
        timeouts: StageTimeouts,
        retry: RetryPolicy,
        apology_slip: bool,
    ) -> TestRig {
        let pool = test_pool().await;
        let base = std::env::temp_dir().join(format!("poetry-cam-orch-{}", Uuid::new_v4()));
        let store = ArtifactStore::new(base.join("images"), base.join("poems"))
            .await
            .expect("store init");

        let orchestrator = Arc::new(Orchestrator::new(
            camera,
            generator,
            printer,
            store.clone(),
            pool.clone(),
            Arc::new(StyleDirective::default()),
            timeouts,
            retry,
            apology_slip,
        ));

        TestRig {
            orchestrator,
            store,
            pool,
        }
    }

    async fn rig(
        camera: Arc<dyn ImageCapture>,
        generator: Arc<dyn PoemGenerator>,
        printer: Arc<dyn Printer>,
    ) -> TestRig {
        rig_with(
            camera,
            generator,
            printer,
            fast_timeouts(),
            fast_retry(),
            false,
        )
        .await
    }

    #[tokio::test]
    async fn test_full_cycle_success() {
        let printer = ScriptedPrinter::succeeding();
        let rig = rig(
            Arc::new(StaticCamera),
            ScriptedGenerator::new(vec![Ok("an old silent pond".to_string())]),
            printer.clone(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.expect("trigger accepted");

        assert_eq!(cycle.stage, Stage::Done);
        assert_eq!(cycle.outcome, Some(Outcome::Done));
        assert_eq!(cycle.capture_attempts, 1);
        assert_eq!(cycle.generation_attempts, 1);
        assert_eq!(cycle.print_attempts, 1);
        assert!(rig.store.image_path(cycle.id).exists());
        assert!(rig.store.poem_path(cycle.id).exists());

        let archived = Cycle::load(cycle.id, &rig.pool).await.unwrap().unwrap();
        assert_eq!(archived.outcome, Some(Outcome::Done));
        assert_eq!(archived.serial, 1);

        assert_eq!(printer.jobs.lock().unwrap().len(), 1);
        assert_eq!(rig.orchestrator.stage(), Stage::Idle);
    }

    #[tokio::test]
    async fn test_generation_recovers_within_budget() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::Network("connection reset".to_string())),
            Err(GenerationError::Timeout(ms(1))),
            Ok("third time lucky".to_string()),
        ]);
        let rig = rig(
            Arc::new(StaticCamera),
            generator.clone(),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.outcome, Some(Outcome::Done));
        assert_eq!(cycle.generation_attempts, 3);
        assert_eq!(generator.calls(), 3);
        assert!(rig.store.poem_path(cycle.id).exists());
    }

    #[tokio::test]
    async fn test_generation_budget_exhausted_preserves_artifact() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::Network("down".to_string())),
            Err(GenerationError::Network("still down".to_string())),
            Err(GenerationError::Network("dead".to_string())),
        ]);
        let rig = rig(
            Arc::new(StaticCamera),
            generator.clone(),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.stage, Stage::Failed);
        assert_eq!(cycle.outcome, Some(Outcome::Failed(FailureReason::Generation)));
        assert_eq!(cycle.generation_attempts, 3);
        assert_eq!(generator.calls(), 3);

        // The photo survives the failed generation stage
        assert!(rig.store.image_path(cycle.id).exists());
        assert!(cycle.poem_path.is_none());
        assert!(!rig.store.poem_path(cycle.id).exists());

        // And the device is back in service
        assert_eq!(rig.orchestrator.stage(), Stage::Idle);
        let next = rig.orchestrator.on_trigger().await;
        assert!(next.is_some());
        assert_eq!(Cycle::count(&rig.pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_trigger_during_active_cycle_is_dropped() {
        let rig = rig(
            Arc::new(StaticCamera),
            Arc::new(SlowGenerator(ms(150))),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let orchestrator = rig.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.on_trigger().await });

        sleep(ms(50)).await;
        assert_eq!(rig.orchestrator.stage(), Stage::Generating);

        // Second press while the first cycle is generating: dropped,
        // and no second cycle record appears.
        assert!(rig.orchestrator.on_trigger().await.is_none());

        let cycle = first.await.unwrap().expect("first trigger accepted");
        assert_eq!(cycle.outcome, Some(Outcome::Done));
        assert_eq!(Cycle::count(&rig.pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capture_timeout_fails_without_retry() {
        let generator = ScriptedGenerator::new(vec![]);
        let rig = rig_with(
            Arc::new(SlowCamera(ms(500))),
            generator.clone(),
            ScriptedPrinter::succeeding(),
            StageTimeouts {
                capture: ms(50),
                generation: ms(250),
                print: ms(250),
            },
            fast_retry(),
            false,
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.outcome, Some(Outcome::Failed(FailureReason::Capture)));
        assert_eq!(cycle.capture_attempts, 1);
        assert_eq!(cycle.generation_attempts, 0);
        assert!(cycle.image_path.is_none());
        assert_eq!(generator.calls(), 0);
        assert_eq!(rig.orchestrator.stage(), Stage::Idle);
    }

    #[tokio::test]
    async fn test_camera_fault_fails_without_retry() {
        let generator = ScriptedGenerator::new(vec![]);
        let rig = rig(
            Arc::new(FailingCamera),
            generator.clone(),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.outcome, Some(Outcome::Failed(FailureReason::Capture)));
        assert_eq!(generator.calls(), 0);

        let archived = Cycle::load(cycle.id, &rig.pool).await.unwrap().unwrap();
        assert_eq!(
            archived.outcome,
            Some(Outcome::Failed(FailureReason::Capture))
        );
    }

    #[tokio::test]
    async fn test_print_budget_exhausted_preserves_poem() {
        let printer = ScriptedPrinter::failing_first(u32::MAX);
        let rig = rig(
            Arc::new(StaticCamera),
            ScriptedGenerator::new(vec![Ok("kept in the archive".to_string())]),
            printer.clone(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.outcome, Some(Outcome::Failed(FailureReason::Print)));
        assert_eq!(cycle.print_attempts, 2);

        // Both artifact and poem survive the failed print stage
        assert!(rig.store.image_path(cycle.id).exists());
        assert!(rig.store.poem_path(cycle.id).exists());
        assert_eq!(rig.orchestrator.stage(), Stage::Idle);
    }

    #[tokio::test]
    async fn test_print_recovers_on_second_attempt() {
        let printer = ScriptedPrinter::failing_first(1);
        let rig = rig(
            Arc::new(StaticCamera),
            ScriptedGenerator::new(vec![Ok("worth a second try".to_string())]),
            printer.clone(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();

        assert_eq!(cycle.outcome, Some(Outcome::Done));
        assert_eq!(cycle.print_attempts, 2);
        assert_eq!(printer.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_poem_text_counts_as_failed_attempt() {
        let generator = ScriptedGenerator::new(vec![
            Ok("   ".to_string()),
            Ok("a real poem".to_string()),
        ]);
        let rig = rig(
            Arc::new(StaticCamera),
            generator,
            ScriptedPrinter::succeeding(),
        )
        .await;

        let cycle = rig.orchestrator.on_trigger().await.unwrap();
        assert_eq!(cycle.outcome, Some(Outcome::Done));
        assert_eq!(cycle.generation_attempts, 2);
    }

    #[tokio::test]
    async fn test_regenerate_reuses_persisted_artifact() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::Network("down".to_string())),
            Err(GenerationError::Network("down".to_string())),
            Err(GenerationError::Network("down".to_string())),
        ]);
        let printer = ScriptedPrinter::succeeding();
        let rig = rig(Arc::new(StaticCamera), generator.clone(), printer.clone()).await;

        let failed = rig.orchestrator.on_trigger().await.unwrap();
        assert_eq!(
            failed.outcome,
            Some(Outcome::Failed(FailureReason::Generation))
        );

        // Service comes back; reprocess the stored photo offline.
        generator.push(Ok("recovered at last".to_string()));
        let redone = rig.orchestrator.regenerate(failed.id).await.unwrap();

        assert_eq!(redone.id, failed.id);
        assert_eq!(redone.outcome, Some(Outcome::Done));
        assert!(rig.store.poem_path(failed.id).exists());
        assert_eq!(printer.jobs.lock().unwrap().len(), 1);

        let archived = Cycle::load(failed.id, &rig.pool).await.unwrap().unwrap();
        assert_eq!(archived.outcome, Some(Outcome::Done));
    }

    #[tokio::test]
    async fn test_regenerate_unknown_cycle_is_an_error() {
        let rig = rig(
            Arc::new(StaticCamera),
            ScriptedGenerator::new(vec![]),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let result = rig.orchestrator.regenerate(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::Database(_))));
    }

    #[tokio::test]
    async fn test_apology_slip_after_generation_failure() {
        let generator = ScriptedGenerator::new(vec![
            Err(GenerationError::Network("down".to_string())),
            Err(GenerationError::Network("down".to_string())),
            Err(GenerationError::Network("down".to_string())),
        ]);
        let printer = ScriptedPrinter::succeeding();
        let rig = rig_with(
            Arc::new(StaticCamera),
            generator,
            printer.clone(),
            fast_timeouts(),
            fast_retry(),
            true,
        )
        .await;

        rig.orchestrator.on_trigger().await.unwrap();

        let notices = printer.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("saved"));
    }

    #[tokio::test]
    async fn test_run_loop_drops_presses_queued_during_cycle() {
        let rig = rig(
            Arc::new(StaticCamera),
            Arc::new(SlowGenerator(ms(150))),
            ScriptedPrinter::succeeding(),
        )
        .await;

        let (tx, rx) = mpsc::channel(8);
        let orchestrator = rig.orchestrator.clone();
        let loop_handle = tokio::spawn(async move { orchestrator.run(rx).await });

        let press = || TriggerEvent {
            pressed_at: Utc::now(),
        };
        tx.send(press()).await.unwrap();
        sleep(ms(50)).await;
        // Impatient presses while the first cycle is mid-generation
        tx.send(press()).await.unwrap();
        tx.send(press()).await.unwrap();
        drop(tx);

        loop_handle.await.unwrap();
        assert_eq!(Cycle::count(&rig.pool).await.unwrap(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            generation_attempts: 5,
            print_attempts: 2,
            backoff_base: ms(500),
            backoff_max: ms(8000),
            print_retry_delay: ms(1000),
        };

        assert_eq!(retry.backoff_delay(0), ms(500));
        assert_eq!(retry.backoff_delay(1), ms(1000));
        assert_eq!(retry.backoff_delay(2), ms(2000));
        assert_eq!(retry.backoff_delay(4), ms(8000));
        assert_eq!(retry.backoff_delay(10), ms(8000));
    }

    #[test]
    fn test_zero_base_backoff_is_zero() {
        let retry = RetryPolicy {
            generation_attempts: 3,
            print_attempts: 2,
            backoff_base: Duration::ZERO,
            backoff_max: ms(8000),
            print_retry_delay: ms(1000),
        };
        assert_eq!(retry.backoff_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_file_name_or_falls_back() {
        assert_eq!(
            file_name_or(Some("/data/images/abc.jpg"), "short.jpg"),
            "abc.jpg"
        );
        assert_eq!(file_name_or(None, "short.jpg"), "short.jpg");
    }
}
