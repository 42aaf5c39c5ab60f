//! Starts and stops scenario managers from the replicated `scenarios` set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use stampede_crdt::{ScenarioEntry, StateKey};
use stampede_metrics::MetricCollector;

use crate::journey::ScenarioResolver;
use crate::manager::ScenarioManager;
use crate::view::ClusterView;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct SchedulerInner {
    /// Specs we have already acted on (including unresolvable ones, so they
    /// are not re-logged every poll).
    known: HashSet<String>,
    managers: Vec<Arc<ScenarioManager>>,
    tasks: HashMap<String, tokio::task::JoinHandle<()>>,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(SchedulerInner::default()),
            running: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn managers(&self) -> Vec<Arc<ScenarioManager>> {
        self.inner.lock().managers.clone()
    }

    /// Total requests spawned by every scenario this node hosts.
    pub fn total_spawned(&self) -> u64 {
        self.inner
            .lock()
            .managers
            .iter()
            .map(|m| m.total_spawned())
            .sum()
    }

    /// Poll the scenarios set once a second, starting a manager for each
    /// spec not yet seen and purging finished ones.
    pub async fn run(
        &self,
        view: Arc<dyn ClusterView>,
        resolver: Arc<dyn ScenarioResolver>,
        collector: Arc<MetricCollector>,
    ) {
        while self.is_running() {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if !self.is_running() {
                break;
            }

            let entries = view.state().set(StateKey::Scenarios).entries();
            for (spec, entry) in entries {
                if self.inner.lock().known.contains(&spec) {
                    continue;
                }
                let scenario_entry = match ScenarioEntry::from_extras(&entry.extras) {
                    Ok(scenario_entry) => scenario_entry,
                    Err(err) => {
                        tracing::error!("malformed scenario entry {spec:?}: {err}");
                        self.inner.lock().known.insert(spec);
                        continue;
                    }
                };
                let resolved = match resolver.resolve(&spec) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        tracing::error!("cannot resolve scenario {spec:?}: {err}");
                        self.inner.lock().known.insert(spec);
                        continue;
                    }
                };
                let start_time = scenario_entry.init_time + resolved.scenario.delay as f64;
                let manager = Arc::new(ScenarioManager::new(
                    Arc::clone(&view),
                    Arc::clone(&collector),
                    spec.clone(),
                    start_time,
                    resolved,
                ));
                let task = tokio::spawn(Arc::clone(&manager).resolve_loop());
                let mut inner = self.inner.lock();
                inner.managers.push(manager);
                inner.tasks.insert(spec.clone(), task);
                inner.known.insert(spec.clone());
                tracing::info!("started new scenario: {spec}");
            }

            self.purge_completed();
        }
        tracing::info!("scheduler shutting down");
    }

    /// Drop managers whose resolve loop has finished.  Their spec leaves
    /// the known set too; if it is still replicated, the resolver's
    /// immediately-complete volume models make the restart a no-op.
    fn purge_completed(&self) {
        let mut inner = self.inner.lock();
        let finished: Vec<String> = inner
            .tasks
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(spec, _)| spec.clone())
            .collect();
        if finished.is_empty() {
            return;
        }
        for spec in &finished {
            inner.tasks.remove(spec);
            inner.known.remove(spec);
            tracing::info!("removed completed scenario: {spec}");
        }
        inner
            .managers
            .retain(|manager| !finished.iter().any(|spec| spec == manager.scenario_spec()));
    }

    /// Stop every manager, cancel in-flight request tasks, and wait.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down scheduler");
        self.running.store(false, Ordering::Relaxed);
        self.cancel.cancel();

        let (managers, tasks) = {
            let mut inner = self.inner.lock();
            let managers = std::mem::take(&mut inner.managers);
            let tasks = std::mem::take(&mut inner.tasks);
            inner.known.clear();
            (managers, tasks)
        };
        for manager in &managers {
            manager.stop();
            manager.cancel_tasks().await;
        }
        for (spec, task) in tasks {
            tracing::debug!("cancelling scenario {spec}");
            task.abort();
            let _ = task.await;
        }
        tracing::info!("scheduler shutdown complete");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("managers", &self.inner.lock().managers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use stampede_crdt::StateStore;
    use stampede_types::{Journey, Scenario, VolumeModel};

    use crate::journey::{JourneyFn, ResolveError, ResolvedScenario};

    struct TestView {
        identity: String,
        state: StateStore,
    }

    impl ClusterView for TestView {
        fn identity(&self) -> &str {
            &self.identity
        }
        fn count(&self) -> usize {
            1
        }
        fn index(&self) -> Option<usize> {
            Some(0)
        }
        fn state(&self) -> &StateStore {
            &self.state
        }
    }

    struct TestResolver;

    impl ScenarioResolver for TestResolver {
        fn resolve(&self, spec: &str) -> Result<ResolvedScenario, ResolveError> {
            if spec != "test:fast" {
                return Err(ResolveError::UnknownSpec(spec.to_string()));
            }
            let journey = Journey::new("j:noop", None, VolumeModel::constant(1, Some(1)));
            let noop: JourneyFn = Arc::new(|_context, _item| Box::pin(async { Ok(()) }));
            let mut journeys: StdHashMap<String, JourneyFn> = StdHashMap::new();
            journeys.insert("j:noop".to_string(), noop);
            Ok(ResolvedScenario {
                scenario: Scenario::new(vec![journey]).with_interval(1).with_delay(1),
                journeys,
            })
        }
    }

    fn add_scenario(view: &TestView, spec: &str) {
        let entry = ScenarioEntry::new(stampede_crdt::wall_clock(), spec);
        view.state
            .set(StateKey::Scenarios)
            .add_now(spec, entry.to_extras());
    }

    #[tokio::test]
    async fn discovered_scenarios_get_a_manager_and_run_to_completion() {
        let view = Arc::new(TestView {
            identity: "node-0".to_string(),
            state: StateStore::new(),
        });
        add_scenario(&view, "test:fast");

        let scheduler = Arc::new(Scheduler::new());
        let collector = Arc::new(MetricCollector::new());
        let run_handle = {
            let scheduler = Arc::clone(&scheduler);
            let view: Arc<dyn ClusterView> = view;
            let collector = Arc::clone(&collector);
            tokio::spawn(async move {
                scheduler.run(view, Arc::new(TestResolver), collector).await;
            })
        };

        // the scenario spawns its single request within a few seconds; read
        // into a local because the purge pass may drop the finished manager
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut observed = 0;
        while observed < 1 && tokio::time::Instant::now() < deadline {
            observed = scheduler.total_spawned();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(observed >= 1);

        scheduler.shutdown().await;
        run_handle.await.unwrap();
    }

    #[tokio::test]
    async fn unresolvable_specs_are_logged_once_and_skipped() {
        let view = Arc::new(TestView {
            identity: "node-0".to_string(),
            state: StateStore::new(),
        });
        add_scenario(&view, "test:unknown");

        let scheduler = Arc::new(Scheduler::new());
        let run_handle = {
            let scheduler = Arc::clone(&scheduler);
            let view: Arc<dyn ClusterView> = view;
            tokio::spawn(async move {
                scheduler
                    .run(view, Arc::new(TestResolver), Arc::new(MetricCollector::new()))
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.managers().is_empty());
        assert!(scheduler.inner.lock().known.contains("test:unknown"));

        scheduler.shutdown().await;
        run_handle.await.unwrap();
    }
}
