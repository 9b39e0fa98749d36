//! Nidra - the sleep cycle
//!
//! A three-phase state machine deciding when consolidation runs:
//! LISTENING idles until the idle timeout, DREAMING runs the injected dream
//! handler under a cancellation token, DEEP_SLEEP cools down, then back to
//! LISTENING. `touch()` resets the idle timer (or wakes), `wake()` forces
//! LISTENING and aborts an in-flight dream, `dispose()` is terminal. The
//! phase is persisted so a restart resumes mid-phase with the remaining
//! duration.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::{MemoryError, Result};
use crate::events::{EventBus, MemoryEvent};

// ============================================================================
// PHASES AND CONFIG
// ============================================================================

/// Sleep phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NidraPhase {
    Listening,
    Dreaming,
    DeepSleep,
}

impl NidraPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NidraPhase::Listening => "LISTENING",
            NidraPhase::Dreaming => "DREAMING",
            NidraPhase::DeepSleep => "DEEP_SLEEP",
        }
    }

    fn parse_name(s: &str) -> Self {
        match s {
            "DREAMING" => NidraPhase::Dreaming,
            "DEEP_SLEEP" => NidraPhase::DeepSleep,
            _ => NidraPhase::Listening,
        }
    }
}

/// Sleep-cycle timings
#[derive(Debug, Clone)]
pub struct NidraConfig {
    /// Idle time in LISTENING before a dream starts
    pub idle_timeout: Duration,
    /// Ceiling on one dream phase
    pub dream_duration: Duration,
    /// Cooldown after dreaming
    pub deep_sleep_duration: Duration,
    /// Heartbeat cadence in every phase
    pub heartbeat_interval: Duration,
}

impl Default for NidraConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            dream_duration: Duration::from_secs(5 * 60),
            deep_sleep_duration: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// The dream handler: consolidation work run while DREAMING
///
/// The token cancels when the dream ends early; the handler must abandon
/// work at its next suspension point without committing partial results.
pub type DreamHandler = Arc<
    dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

#[derive(Debug)]
enum Control {
    Touch,
    Wake,
    Dispose,
}

// ============================================================================
// NIDRA CYCLE
// ============================================================================

/// The sleep-cycle driver
pub struct NidraCycle {
    db: Arc<Database>,
    config: NidraConfig,
    bus: EventBus,
    handler: DreamHandler,
    control: mpsc::Sender<Control>,
    control_rx: std::sync::Mutex<Option<mpsc::Receiver<Control>>>,
    disposed: Arc<AtomicBool>,
    started: AtomicBool,
}

impl NidraCycle {
    pub fn new(db: Arc<Database>, config: NidraConfig, bus: EventBus, handler: DreamHandler) -> Self {
        let (control, control_rx) = mpsc::channel(16);
        Self {
            db,
            config,
            bus,
            handler,
            control,
            control_rx: std::sync::Mutex::new(Some(control_rx)),
            disposed: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MemoryError::Invariant("nidra cycle is disposed".to_string()));
        }
        Ok(())
    }

    /// Persisted phase plus how long it has been held
    fn restore_phase(&self) -> Result<(NidraPhase, Duration)> {
        let reader = self.db.reader()?;
        let row: Option<(String, String)> = reader
            .query_row(
                "SELECT state, entered_at FROM nidra_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((state, entered)) => {
                let phase = NidraPhase::parse_name(&state);
                let held = DateTime::parse_from_rfc3339(&entered)
                    .map(|dt| {
                        (Utc::now() - dt.with_timezone(&Utc))
                            .to_std()
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                Ok((phase, held))
            }
            None => Ok((NidraPhase::Listening, Duration::ZERO)),
        }
    }

    fn persist_phase(db: &Database, phase: NidraPhase) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let writer = db.writer()?;
        writer.execute(
            "INSERT INTO nidra_state (id, state, entered_at, updated_at)
             VALUES (1, ?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET
                 state = excluded.state,
                 entered_at = excluded.entered_at,
                 updated_at = excluded.updated_at",
            params![phase.as_str(), now],
        )?;
        Ok(())
    }

    /// Start the driver task; restores the persisted phase and completes
    /// its remaining duration
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.check_alive()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MemoryError::Invariant("nidra cycle already started".to_string()));
        }
        let mut receiver = self
            .control_rx
            .lock()
            .map_err(|_| MemoryError::lock("nidra control"))?
            .take()
            .ok_or_else(|| MemoryError::Invariant("nidra control channel consumed".to_string()))?;

        let (mut phase, held) = self.restore_phase()?;
        let this = self.clone();

        tokio::spawn(async move {
            let mut remaining = this.phase_duration(phase).saturating_sub(held);
            let mut heartbeat = tokio::time::interval(this.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let deadline = tokio::time::Instant::now() + remaining;
                let mut dream: Option<(CancellationToken, tokio::task::JoinHandle<Result<()>>)> =
                    None;

                if phase == NidraPhase::Dreaming {
                    this.bus
                        .emit(MemoryEvent::NidraConsolidationStart { at: Utc::now() });
                    let token = CancellationToken::new();
                    let handler = this.handler.clone();
                    let handle = tokio::spawn((handler)(token.clone()));
                    dream = Some((token, handle));
                }

                // Hold the phase until its deadline or a control command
                let next = loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            break match phase {
                                NidraPhase::Listening => Some(NidraPhase::Dreaming),
                                NidraPhase::Dreaming => Some(NidraPhase::DeepSleep),
                                NidraPhase::DeepSleep => Some(NidraPhase::Listening),
                            };
                        }
                        _ = heartbeat.tick() => {
                            this.bus.emit(MemoryEvent::NidraHeartbeat {
                                state: phase.as_str().to_string(),
                                at: Utc::now(),
                            });
                        }
                        command = receiver.recv() => {
                            match command {
                                Some(Control::Touch) if phase == NidraPhase::Listening => {
                                    // Reset the idle timer
                                    break Some(NidraPhase::Listening);
                                }
                                Some(Control::Touch) | Some(Control::Wake) => {
                                    break Some(NidraPhase::Listening);
                                }
                                Some(Control::Dispose) | None => break None,
                            }
                        }
                    }
                };

                // Wind down any in-flight dream
                if let Some((token, handle)) = dream {
                    // An unfinished handler means its progress is discarded
                    let cancelled = !handle.is_finished();
                    token.cancel();
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(MemoryError::Cancelled)) => {
                            tracing::debug!("dream handler observed cancellation");
                        }
                        Ok(Err(e)) => tracing::warn!(error = %e, "dream handler failed"),
                        Err(e) => tracing::warn!(error = %e, "dream handler panicked"),
                    }
                    this.bus.emit(MemoryEvent::NidraConsolidationEnd {
                        at: Utc::now(),
                        cancelled,
                    });
                }

                let Some(next_phase) = next else {
                    break;
                };

                if next_phase != phase {
                    this.bus.emit(MemoryEvent::NidraStateChange {
                        from: phase.as_str().to_string(),
                        to: next_phase.as_str().to_string(),
                        at: Utc::now(),
                    });
                }
                phase = next_phase;
                remaining = this.phase_duration(phase);
                if let Err(e) = Self::persist_phase(&this.db, phase) {
                    tracing::warn!(error = %e, "failed to persist nidra phase");
                }
            }
            tracing::debug!("nidra driver stopped");
        });

        Ok(())
    }

    fn phase_duration(&self, phase: NidraPhase) -> Duration {
        match phase {
            NidraPhase::Listening => self.config.idle_timeout,
            NidraPhase::Dreaming => self.config.dream_duration,
            NidraPhase::DeepSleep => self.config.deep_sleep_duration,
        }
    }

    /// Activity signal: resets the idle timer when listening, wakes
    /// otherwise
    pub async fn touch(&self) -> Result<()> {
        self.check_alive()?;
        self.control
            .send(Control::Touch)
            .await
            .map_err(|_| MemoryError::Invariant("nidra driver gone".to_string()))
    }

    /// Force a return to LISTENING, aborting any in-flight dream
    pub async fn wake(&self) -> Result<()> {
        self.check_alive()?;
        self.control
            .send(Control::Wake)
            .await
            .map_err(|_| MemoryError::Invariant("nidra driver gone".to_string()))
    }

    /// Terminal shutdown; all later calls fail
    pub async fn dispose(&self) -> Result<()> {
        self.check_alive()?;
        self.disposed.store(true, Ordering::SeqCst);
        let _ = self.control.send(Control::Dispose).await;
        Ok(())
    }

    /// Currently persisted phase
    pub fn current_phase(&self) -> Result<NidraPhase> {
        Ok(self.restore_phase()?.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn cycle(
        config: NidraConfig,
        runs: Arc<AtomicUsize>,
    ) -> (TempDir, Arc<NidraCycle>, EventBus) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("agent.db"), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        let bus = EventBus::default();
        let handler: DreamHandler = Arc::new(move |token: CancellationToken| {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = token.cancelled() => Err(MemoryError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => Ok(()),
                }
            })
        });
        let cycle = Arc::new(NidraCycle::new(db, config, bus.clone(), handler));
        (dir, cycle, bus)
    }

    fn fast_config() -> NidraConfig {
        NidraConfig {
            idle_timeout: Duration::from_millis(50),
            dream_duration: Duration::from_millis(80),
            deep_sleep_duration: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(25),
        }
    }

    #[tokio::test]
    async fn test_full_cycle_runs_consolidation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (_dir, cycle, bus) = cycle(fast_config(), runs.clone());
        let mut rx = bus.subscribe();
        cycle.start().unwrap();

        // Collect events until the cycle has dreamed and returned
        let mut saw_start = false;
        let mut saw_end = false;
        let mut saw_dreaming = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline && !(saw_start && saw_end) {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(event)) => match event {
                    MemoryEvent::NidraConsolidationStart { .. } => saw_start = true,
                    MemoryEvent::NidraConsolidationEnd { .. } => saw_end = true,
                    MemoryEvent::NidraStateChange { to, .. } if to == "DREAMING" => {
                        saw_dreaming = true
                    }
                    _ => {}
                },
                _ => break,
            }
        }
        assert!(saw_dreaming && saw_start && saw_end);
        assert!(runs.load(Ordering::SeqCst) >= 1);
        cycle.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_touch_defers_dreaming() {
        let runs = Arc::new(AtomicUsize::new(0));
        let config = NidraConfig {
            idle_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let (_dir, cycle, _bus) = cycle(config, runs.clone());
        cycle.start().unwrap();

        // Keep touching under the idle timeout; no dream should fire
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            cycle.touch().await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        cycle.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_wake_cancels_dream() {
        let runs = Arc::new(AtomicUsize::new(0));
        let config = NidraConfig {
            idle_timeout: Duration::from_millis(20),
            dream_duration: Duration::from_secs(30),
            ..fast_config()
        };
        let (_dir, cycle, bus) = cycle(config, runs.clone());
        let mut rx = bus.subscribe();
        cycle.start().unwrap();

        // Wait for the dream to start, then wake
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut dreaming = false;
        while tokio::time::Instant::now() < deadline && !dreaming {
            if let Ok(Ok(MemoryEvent::NidraConsolidationStart { .. })) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                dreaming = true;
            }
        }
        assert!(dreaming);
        cycle.wake().await.unwrap();

        // The end event marks the run as cancelled
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no end event");
            if let Ok(Ok(MemoryEvent::NidraConsolidationEnd { cancelled, .. })) =
                tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
            {
                assert!(cancelled);
                break;
            }
        }
        cycle.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (_dir, cycle, _bus) = cycle(fast_config(), runs);
        cycle.start().unwrap();
        cycle.dispose().await.unwrap();

        assert!(cycle.touch().await.is_err());
        assert!(cycle.wake().await.is_err());
        assert!(cycle.start().is_err());
        assert!(cycle.dispose().await.is_err());
    }

    #[tokio::test]
    async fn test_phase_persisted_and_restored() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("agent.db"), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        NidraCycle::persist_phase(&db, NidraPhase::DeepSleep).unwrap();

        let handler: DreamHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        let cycle = Arc::new(NidraCycle::new(
            db,
            NidraConfig::default(),
            EventBus::default(),
            handler,
        ));
        assert_eq!(cycle.current_phase().unwrap(), NidraPhase::DeepSleep);
    }
}
