/*!
 * Lifecycle hook dispatcher.
 *
 * A state machine over [`LifecyclePhase`], one per environment run. Phases
 * are entered strictly in order starting at INIT; TEARDOWN can be entered
 * from anywhere. No phase runs twice.
 */
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use benchfarm_core::{event::SharedEventBus, logging::phase_span, types::Id, utils::with_timeout};
use benchfarm_devices::DeviceSnapshot;

use crate::error::{Error, Result};
use crate::hook::{HookContext, HookRegistry};
use crate::phase::LifecyclePhase;

/// Events published by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The run entered a phase
    PhaseEntered {
        /// Environment run
        run_id: Id,
        /// Phase entered
        phase: LifecyclePhase,
    },
    /// A phase finished; critical failures end the phase early
    PhaseCompleted {
        /// Environment run
        run_id: Id,
        /// Phase completed
        phase: LifecyclePhase,
        /// Whether every hook succeeded
        clean: bool,
    },
}

/// An advisory hook failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
    /// Hook name
    pub hook: String,
    /// Failure description
    pub reason: String,
}

/// Outcome of one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Phase that ran
    pub phase: LifecyclePhase,
    /// Hooks invoked, in order
    pub hooks_run: Vec<String>,
    /// Advisory failures
    pub failures: Vec<HookFailure>,
    /// When the phase was entered
    pub started_at: DateTime<Utc>,
    /// When the last hook returned
    pub finished_at: DateTime<Utc>,
}

impl PhaseReport {
    /// Whether every hook succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives the phases of one environment run
#[derive(Debug)]
pub struct LifecycleDispatcher {
    run_id: Id,
    hooks: Arc<HookRegistry>,
    hook_timeout: Duration,
    event_bus: Option<SharedEventBus>,
    cancel: CancellationToken,
    current: Option<LifecyclePhase>,
    history: Vec<LifecyclePhase>,
    aborted: bool,
}

impl LifecycleDispatcher {
    /// Create a dispatcher for run `run_id`
    pub fn new(run_id: Id, hooks: Arc<HookRegistry>, hook_timeout: Duration) -> Self {
        Self {
            run_id,
            hooks,
            hook_timeout,
            event_bus: None,
            cancel: CancellationToken::new(),
            current: None,
            history: Vec::new(),
            aborted: false,
        }
    }

    /// Publish phase changes on `bus`
    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Abandon setup phases when `cancel` fires
    ///
    /// A cancelled hook fails the phase with [`Error::Cancelled`]. TEARDOWN
    /// hooks are not interrupted.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The run this dispatcher drives
    pub fn run_id(&self) -> &Id {
        &self.run_id
    }

    /// Phase most recently entered
    pub fn current(&self) -> Option<LifecyclePhase> {
        self.current
    }

    /// Phases entered so far, in order
    pub fn history(&self) -> &[LifecyclePhase] {
        &self.history
    }

    /// Whether a critical failure has forced the run towards TEARDOWN
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn check_transition(&self, phase: LifecyclePhase) -> Result<()> {
        if self.history.contains(&phase) {
            return Err(Error::PhaseAlreadyRun(phase));
        }
        if phase == LifecyclePhase::Teardown {
            return Ok(());
        }

        let expected = match self.current {
            None => Some(LifecyclePhase::Init),
            Some(current) => current.next(),
        };
        if self.aborted || expected != Some(phase) {
            return Err(Error::InvalidTransition {
                from: self.current,
                to: phase,
            });
        }
        Ok(())
    }

    fn publish(&self, event: LifecycleEvent) {
        if let Some(bus) = &self.event_bus {
            if let Err(e) = bus.publish(event) {
                warn!("Could not publish lifecycle event: {}", e);
            }
        }
    }

    /// Enter `phase` and run its hooks against `snapshot`
    ///
    /// Hooks whose filter matches no device are skipped. A critical failure
    /// stops the phase, returns [`Error::HookFailed`] and leaves TEARDOWN as
    /// the only phase that can be entered. TEARDOWN failures never abort.
    pub async fn run_phase(&mut self, phase: LifecyclePhase, snapshot: &DeviceSnapshot) -> Result<PhaseReport> {
        self.check_transition(phase)?;
        self.current = Some(phase);
        self.history.push(phase);
        self.publish(LifecycleEvent::PhaseEntered {
            run_id: self.run_id.clone(),
            phase,
        });

        let span = phase_span(phase.as_str(), self.run_id.as_str());
        let result = self.invoke_hooks(phase, snapshot).instrument(span).await;

        self.publish(LifecycleEvent::PhaseCompleted {
            run_id: self.run_id.clone(),
            phase,
            clean: matches!(&result, Ok(report) if report.is_clean()),
        });
        if result.is_err() {
            self.aborted = true;
        }
        result
    }

    /// Run TEARDOWN unless it has already run
    pub async fn teardown(&mut self, snapshot: &DeviceSnapshot) -> Option<PhaseReport> {
        if self.history.contains(&LifecyclePhase::Teardown) {
            debug!("TEARDOWN already ran for {}", self.run_id);
            return None;
        }
        self.run_phase(LifecyclePhase::Teardown, snapshot).await.ok()
    }

    async fn invoke_hooks(&self, phase: LifecyclePhase, snapshot: &DeviceSnapshot) -> Result<PhaseReport> {
        let started_at = Utc::now();
        let mut hooks_run = Vec::new();
        let mut failures = Vec::new();

        info!("Entering {}", phase);
        let cancellable = phase != LifecyclePhase::Teardown;
        for registration in self.hooks.for_phase(phase) {
            let matching = registration.filter.select(snapshot);
            if matching.is_empty() {
                debug!("Skipping hook {}: no device for {}", registration.name, registration.filter);
                continue;
            }

            debug!(
                "Running hook {} from {} on {} device(s)",
                registration.name,
                registration.source,
                matching.len()
            );
            let context = HookContext {
                run_id: self.run_id.clone(),
                phase,
                snapshot: snapshot.clone(),
                matching,
            };
            hooks_run.push(registration.name.clone());

            let call = with_timeout(self.hook_timeout, registration.hook().run(context));
            let outcome = if cancellable {
                tokio::select! {
                    outcome = call => outcome,
                    _ = self.cancel.cancelled() => {
                        warn!("Hook {} cancelled in {}", registration.name, phase);
                        return Err(Error::Cancelled);
                    }
                }
            } else {
                call.await
            };
            let Err(e) = outcome else { continue };

            let reason = format!("{:#}", e);
            if registration.is_critical() && phase != LifecyclePhase::Teardown {
                error!("Critical hook {} failed in {}: {}", registration.name, phase, reason);
                return Err(Error::HookFailed {
                    hook: registration.name.clone(),
                    phase,
                    critical: true,
                    reason,
                });
            }
            warn!("Hook {} failed in {}: {}", registration.name, phase, reason);
            failures.push(HookFailure {
                hook: registration.name.clone(),
                reason,
            });
        }

        Ok(PhaseReport {
            phase,
            hooks_run,
            failures,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookSpec;
    use benchfarm_devices::testing::stub_instance;
    use benchfarm_devices::DeviceManager;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &str, phase: LifecyclePhase) -> HookSpec {
        let log = log.clone();
        let entry = name.to_string();
        HookSpec::from_fn(name, phase, move |_ctx| {
            let log = log.clone();
            let entry = entry.clone();
            async move {
                log.lock().unwrap().push(entry);
                Ok(())
            }
        })
    }

    fn failing(name: &str, phase: LifecyclePhase) -> HookSpec {
        HookSpec::from_fn(name, phase, |_ctx| async { Err(anyhow::anyhow!("boom")) })
    }

    fn dispatcher(hooks: HookRegistry) -> LifecycleDispatcher {
        LifecycleDispatcher::new(Id::new(), Arc::new(hooks), Duration::from_millis(200))
    }

    async fn snapshot() -> DeviceSnapshot {
        let manager = DeviceManager::new();
        manager.register(stub_instance("board", "CPE", false).await.unwrap()).unwrap();
        manager.register(stub_instance("lan", "LAN", false).await.unwrap()).unwrap();
        manager.snapshot().unwrap()
    }

    async fn advance_to(dispatcher: &mut LifecycleDispatcher, phase: LifecyclePhase, snapshot: &DeviceSnapshot) {
        for step in LifecyclePhase::SETUP {
            dispatcher.run_phase(step, snapshot).await.unwrap();
            if step == phase {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_hooks_ordered_by_priority_then_registration() {
        let log: Log = Arc::default();
        let mut hooks = HookRegistry::new();
        hooks.register("core", recording(&log, "h1", LifecyclePhase::Init).priority(5));
        hooks.register("core", recording(&log, "h2", LifecyclePhase::Init).priority(1));
        hooks.register("vendor", recording(&log, "h3", LifecyclePhase::Init).priority(5));

        let report = dispatcher(hooks)
            .run_phase(LifecyclePhase::Init, &snapshot().await)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h3", "h2"]);
        assert_eq!(report.hooks_run, vec!["h1", "h3", "h2"]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_role_filter_skips_unmatched_hooks() {
        let log: Log = Arc::default();
        let mut hooks = HookRegistry::new();
        hooks.register("core", recording(&log, "acs-only", LifecyclePhase::Init).role("ACS"));
        hooks.register("core", recording(&log, "cpe-only", LifecyclePhase::Init).role("CPE"));
        hooks.register(
            "core",
            HookSpec::from_fn("matching", LifecyclePhase::Init, |ctx| async move {
                anyhow::ensure!(ctx.matching.len() == 1 && ctx.matching[0].name() == "lan");
                anyhow::ensure!(ctx.snapshot.len() == 2);
                Ok(())
            })
            .role("LAN")
            .critical(),
        );

        let report = dispatcher(hooks)
            .run_phase(LifecyclePhase::Init, &snapshot().await)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["cpe-only"]);
        assert_eq!(report.hooks_run, vec!["cpe-only", "matching"]);
    }

    #[tokio::test]
    async fn test_phase_already_run() {
        let snapshot = snapshot().await;
        let mut dispatcher = dispatcher(HookRegistry::new());
        dispatcher.run_phase(LifecyclePhase::Init, &snapshot).await.unwrap();

        let result = dispatcher.run_phase(LifecyclePhase::Init, &snapshot).await;
        assert!(matches!(result, Err(Error::PhaseAlreadyRun(LifecyclePhase::Init))));
    }

    #[tokio::test]
    async fn test_phases_cannot_be_skipped() {
        let snapshot = snapshot().await;
        let mut dispatcher = dispatcher(HookRegistry::new());

        let result = dispatcher.run_phase(LifecyclePhase::Boot, &snapshot).await;
        assert!(matches!(
            result,
            Err(Error::InvalidTransition { from: None, to: LifecyclePhase::Boot })
        ));

        advance_to(&mut dispatcher, LifecyclePhase::PreBoot, &snapshot).await;
        let result = dispatcher.run_phase(LifecyclePhase::Provision, &snapshot).await;
        assert!(matches!(
            result,
            Err(Error::InvalidTransition { from: Some(LifecyclePhase::PreBoot), .. })
        ));
        assert_eq!(dispatcher.history(), &[LifecyclePhase::Init, LifecyclePhase::PreBoot]);
    }

    #[tokio::test]
    async fn test_advisory_failure_continues_phase() {
        let log: Log = Arc::default();
        let mut hooks = HookRegistry::new();
        hooks.register("core", failing("flaky", LifecyclePhase::Init).priority(2));
        hooks.register("core", recording(&log, "after", LifecyclePhase::Init));

        let report = dispatcher(hooks)
            .run_phase(LifecyclePhase::Init, &snapshot().await)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].hook, "flaky");
        assert_eq!(report.failures[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_critical_failure_forces_teardown() {
        let log: Log = Arc::default();
        let mut hooks = HookRegistry::new();
        hooks.register("core", failing("flash", LifecyclePhase::Init).critical().priority(1));
        hooks.register("core", recording(&log, "skipped", LifecyclePhase::Init));
        hooks.register("core", recording(&log, "cleanup", LifecyclePhase::Teardown));
        let snapshot = snapshot().await;
        let mut dispatcher = dispatcher(hooks);

        let result = dispatcher.run_phase(LifecyclePhase::Init, &snapshot).await;
        assert!(matches!(result, Err(Error::HookFailed { critical: true, ref hook, .. }) if hook == "flash"));
        assert!(dispatcher.is_aborted());

        let result = dispatcher.run_phase(LifecyclePhase::PreBoot, &snapshot).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));

        let report = dispatcher.teardown(&snapshot).await.unwrap();
        assert_eq!(report.hooks_run, vec!["cleanup"]);
        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
        assert!(dispatcher.teardown(&snapshot).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_hook() {
        let log: Log = Arc::default();
        let mut hooks = HookRegistry::new();
        hooks.register(
            "core",
            HookSpec::from_fn("wait-for-boot", LifecyclePhase::Init, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );
        hooks.register("core", recording(&log, "cleanup", LifecyclePhase::Teardown));
        let snapshot = snapshot().await;

        let cancel = CancellationToken::new();
        let mut dispatcher = LifecycleDispatcher::new(Id::new(), Arc::new(hooks), Duration::from_secs(600))
            .with_cancellation(cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = dispatcher.run_phase(LifecyclePhase::Init, &snapshot).await;
        trigger.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(dispatcher.is_aborted());

        let report = dispatcher.teardown(&snapshot).await.unwrap();
        assert_eq!(report.hooks_run, vec!["cleanup"]);
        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
    }

    #[tokio::test]
    async fn test_teardown_failures_are_advisory() {
        let mut hooks = HookRegistry::new();
        hooks.register("core", failing("power-off", LifecyclePhase::Teardown).critical());

        let report = dispatcher(hooks)
            .run_phase(LifecyclePhase::Teardown, &snapshot().await)
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_hook_timeout_counts_as_failure() {
        let mut hooks = HookRegistry::new();
        hooks.register(
            "core",
            HookSpec::from_fn("hang", LifecyclePhase::Init, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .critical(),
        );
        let mut dispatcher = LifecycleDispatcher::new(Id::new(), Arc::new(hooks), Duration::from_millis(10));

        let result = dispatcher.run_phase(LifecyclePhase::Init, &snapshot().await).await;
        assert!(matches!(result, Err(Error::HookFailed { ref reason, .. }) if reason.starts_with("Timed out")));
    }

    #[tokio::test]
    async fn test_phase_events_published() {
        let bus = SharedEventBus::new();
        let mut events = bus.subscribe::<LifecycleEvent>().unwrap();
        let mut dispatcher = dispatcher(HookRegistry::new()).with_event_bus(bus);
        let run_id = dispatcher.run_id().clone();

        dispatcher.run_phase(LifecyclePhase::Init, &snapshot().await).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::PhaseEntered {
                run_id: run_id.clone(),
                phase: LifecyclePhase::Init
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::PhaseCompleted {
                run_id,
                phase: LifecyclePhase::Init,
                clean: true
            }
        );
    }
}
