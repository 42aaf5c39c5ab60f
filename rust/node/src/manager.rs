//! One manager per active scenario: divides each interval's volume across
//! the live set, checks data items out of the journey's pool without
//! cross-node duplication, and spawns a context-scoped task per request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use stampede_metrics::{record_journey_failure, record_journey_success, MetricCollector};
use stampede_types::JourneyComplete;

use crate::context::{Context, ContextMetadata};
use crate::journey::{JourneyFn, ResolvedScenario};
use crate::partition::{journey_offset, target_volume_per_node};
use crate::view::ClusterView;

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One journey's slice of one work interval on this node.
pub struct Work {
    /// Seconds since scenario start at which this interval begins.
    pub start_time: u64,
    pub journey_spec: String,
    /// This node's checked-out datapool slice, when the journey has a pool.
    pub data: Option<stampede_datapool::ItemIter>,
    /// This node's share for each sub-second of the interval.
    pub subint_volumes: Vec<u64>,
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("start_time", &self.start_time)
            .field("journey_spec", &self.journey_spec)
            .field("subint_volumes", &self.subint_volumes)
            .finish()
    }
}

pub struct ScenarioManager {
    view: Arc<dyn ClusterView>,
    collector: Arc<MetricCollector>,
    scenario_spec: String,
    /// Absolute unix time the scenario's clock starts from.
    start_time: f64,
    scenario: stampede_types::Scenario,
    journeys: HashMap<String, JourneyFn>,
    work_resolved: Mutex<HashSet<u64>>,
    /// Journey spec -> work index at which its volume model completed.
    journeys_complete: Mutex<HashMap<String, u64>>,
    total_spawned: AtomicU64,
    running: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ScenarioManager {
    pub fn new(
        view: Arc<dyn ClusterView>,
        collector: Arc<MetricCollector>,
        scenario_spec: impl Into<String>,
        start_time: f64,
        resolved: ResolvedScenario,
    ) -> Self {
        ScenarioManager {
            view,
            collector,
            scenario_spec: scenario_spec.into(),
            start_time,
            scenario: resolved.scenario,
            journeys: resolved.journeys,
            work_resolved: Mutex::new(HashSet::new()),
            journeys_complete: Mutex::new(HashMap::new()),
            total_spawned: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn scenario_spec(&self) -> &str {
        &self.scenario_spec
    }

    pub fn total_spawned(&self) -> u64 {
        self.total_spawned.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Seconds since scenario start; negative while the start delay has not
    /// elapsed yet.
    pub fn elapsed(&self) -> f64 {
        unix_now() - self.start_time
    }

    pub fn work_index(&self) -> u64 {
        (self.elapsed().max(0.0) / self.scenario.interval as f64) as u64
    }

    /// Sleep to each interval boundary and resolve it, until the scenario
    /// completes or the node shuts down.
    pub async fn resolve_loop(self: Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        while self.is_running() && !self.cancel.is_cancelled() {
            let interval = self.scenario.interval as f64;
            let wait = interval - self.elapsed().rem_euclid(interval);
            tracing::debug!(
                scenario = %self.scenario_spec,
                "time until next work interval: {wait:.3}s"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
            }
            self.resolve_once().await;
        }
    }

    async fn resolve_once(self: &Arc<Self>) {
        let index = self.work_index();
        let already_resolved = {
            let mut resolved = self.work_resolved.lock();
            if resolved.contains(&index) {
                true
            } else {
                resolved.insert(index);
                false
            }
        };
        if already_resolved {
            // Already handled this interval; nap briefly unless the
            // scenario finished while we slept.
            if !self.is_running() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(self.scenario.journey_separation)) => {}
            }
            return;
        }
        for work in self.work(index) {
            let manager = Arc::clone(self);
            self.tasks.spawn(async move {
                manager.spawn_journeys(work).await;
            });
        }
    }

    /// Build this node's work items for one interval.
    ///
    /// For every live journey the cluster-wide per-second volume is split
    /// across all nodes; we keep our own sub-second share list and the
    /// per-node totals needed to slice the datapool.  The pool cursor
    /// advances by the cluster total so every node's next interval starts
    /// from the same position.
    pub fn work(&self, work_index: u64) -> Vec<Work> {
        let node_count = self.view.count();
        if node_count == 0 {
            return Vec::new();
        }
        let my_index = self.view.index();
        let work_start_time = work_index * self.scenario.interval;
        let mut work_items = Vec::new();
        let mut scenario_complete = true;
        let mut journeys_complete = self.journeys_complete.lock();

        for journey in &self.scenario.journeys {
            if matches!(journeys_complete.get(&journey.spec), Some(done) if *done < work_index) {
                continue;
            }
            scenario_complete = false;

            let offset = journey_offset(&journey.spec, node_count);
            let mut subint_volumes = Vec::new();
            let mut per_node_totals = vec![0u64; node_count];

            for i in 0..self.scenario.interval {
                match journey.volume.target_at(work_start_time + i) {
                    Ok(volume) => {
                        for (node_index, node_total) in per_node_totals.iter_mut().enumerate() {
                            let share =
                                target_volume_per_node(node_index, node_count, volume, offset);
                            *node_total += share;
                            if Some(node_index) == my_index {
                                subint_volumes.push(share);
                            }
                        }
                    }
                    Err(JourneyComplete) => {
                        tracing::warn!(
                            "journey {} completes at work index {work_index}, removing from scenario",
                            journey.spec
                        );
                        journeys_complete.insert(journey.spec.clone(), work_index);
                        break;
                    }
                }
            }

            let cluster_total: u64 = per_node_totals.iter().sum();
            if cluster_total == 0 {
                continue;
            }

            let mut data = None;
            if let (Some(pool), Some(my_index)) = (&journey.datapool, my_index) {
                let mut pool = pool.lock();
                // A zero cursor past the first interval means we joined the
                // scenario late: fast-forward over everything the cluster
                // has already dispensed.
                if work_index > 0 && pool.cursor() == 0 {
                    let dispensed = journey.volume.cumulative_volume(0, work_start_time - 1);
                    pool.set_cursor(dispensed as usize);
                }
                let node_offset: u64 = per_node_totals[..my_index].iter().sum();
                let checkout_start = pool.cursor() + node_offset as usize;
                let my_total = per_node_totals[my_index] as usize;
                data = Some(self.checkout(&mut *pool, &journey.spec, checkout_start, my_total));
                pool.advance_cursor(cluster_total as usize);
            }

            work_items.push(Work {
                start_time: work_start_time,
                journey_spec: journey.spec.clone(),
                data,
                subint_volumes,
            });
        }

        if scenario_complete {
            tracing::warn!(
                scenario = %self.scenario_spec,
                "scenario complete, no more work to be done"
            );
            self.running.store(false, Ordering::Relaxed);
        }

        work_items
    }

    fn checkout(
        &self,
        pool: &mut dyn stampede_datapool::Datapool,
        spec: &str,
        start: usize,
        count: usize,
    ) -> stampede_datapool::ItemIter {
        let empty: stampede_datapool::ItemIter = Box::new(std::iter::empty());
        if count == 0 {
            return empty;
        }
        let len = match pool.len() {
            Ok(len) => len,
            Err(err) => {
                tracing::error!("datapool length failed for {spec}: {err}");
                return empty;
            }
        };
        if start > len {
            // this node's slice starts past the end; the pool is exhausted
            return empty;
        }
        match pool.checkout(start, Some(start + count)) {
            Ok(iter) => iter,
            Err(err) => {
                tracing::error!("datapool checkout failed for {spec}: {err}");
                empty
            }
        }
    }

    /// Pace this node's share of the interval: one burst per sub-interval,
    /// `journey_separation` seconds apart, one fresh context per request.
    async fn spawn_journeys(self: Arc<Self>, work: Work) {
        let Some(journey_fn) = self.journeys.get(&work.journey_spec).cloned() else {
            tracing::error!("no journey function for spec {:?}", work.journey_spec);
            return;
        };
        let mut data = work.data;
        let separation = Duration::from_secs_f64(self.scenario.journey_separation);

        for sub_interval in 0..self.scenario.sub_intervals() {
            let Some(volume) = work.subint_volumes.get(sub_interval).copied() else {
                return;
            };
            for _ in 0..volume {
                let item = match &mut data {
                    Some(iter) => match iter.next() {
                        Some(item) => Some(item),
                        None => {
                            tracing::warn!("datapool exhausted, no more items available");
                            break;
                        }
                    },
                    None => None,
                };
                let context = Context::new(
                    Arc::clone(&self.collector),
                    ContextMetadata {
                        scenario: self.scenario_spec.clone(),
                        journey_spec: work.journey_spec.clone(),
                        node: self.view.identity().to_string(),
                    },
                );
                let journey_fn = Arc::clone(&journey_fn);
                let collector = Arc::clone(&self.collector);
                let cancel = self.cancel.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = run_journey(journey_fn, context, item, collector) => {}
                    }
                });
                self.total_spawned.fetch_add(1, Ordering::Relaxed);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(separation) => {}
            }
        }
    }

    /// Stop the loops and wait for every in-flight request task.
    pub async fn cancel_tasks(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl std::fmt::Debug for ScenarioManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioManager")
            .field("scenario", &self.scenario_spec)
            .field("start_time", &self.start_time)
            .field("total_spawned", &self.total_spawned())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Execute one request inside its context, recording success or failure.
/// The context travels into the journey and closes when it drops, so
/// cleanup hooks run even when the journey errors.
async fn run_journey(
    journey_fn: JourneyFn,
    context: Context,
    item: Option<String>,
    collector: Arc<MetricCollector>,
) {
    let labels = context.scenario_labels();
    let spec = labels.journey.clone();
    let start = Instant::now();
    match journey_fn(context, item).await {
        Ok(()) => {
            record_journey_success(&collector, &labels, start.elapsed().as_secs_f64());
        }
        Err(err) => {
            record_journey_failure(&collector, &labels, start.elapsed().as_secs_f64(), &err.kind);
            tracing::error!("journey {spec} failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use stampede_crdt::StateStore;
    use stampede_datapool::IterableDatapool;
    use stampede_types::{Journey, Scenario, VolumeModel};

    /// A fixed cluster shape for driving work() without a live gossip mesh.
    struct FakeView {
        identity: String,
        count: usize,
        index: Option<usize>,
        state: StateStore,
    }

    impl FakeView {
        fn new(count: usize, index: usize) -> Arc<Self> {
            Arc::new(FakeView {
                identity: format!("node-{index}"),
                count,
                index: Some(index),
                state: StateStore::new(),
            })
        }
    }

    impl ClusterView for FakeView {
        fn identity(&self) -> &str {
            &self.identity
        }
        fn count(&self) -> usize {
            self.count
        }
        fn index(&self) -> Option<usize> {
            self.index
        }
        fn state(&self) -> &StateStore {
            &self.state
        }
    }

    fn noop_journey() -> JourneyFn {
        Arc::new(|_context, _item| Box::pin(async { Ok(()) }))
    }

    fn manager_starting_at(
        view: Arc<FakeView>,
        journeys: Vec<Journey>,
        interval: u64,
        start_time: f64,
    ) -> ScenarioManager {
        let mut journey_fns: HashMap<String, JourneyFn> = HashMap::new();
        for journey in &journeys {
            journey_fns.insert(journey.spec.clone(), noop_journey());
        }
        let resolved = ResolvedScenario {
            scenario: Scenario::new(journeys).with_interval(interval).with_delay(0),
            journeys: journey_fns,
        };
        ScenarioManager::new(
            view,
            Arc::new(MetricCollector::new()),
            "test:scenario",
            start_time,
            resolved,
        )
    }

    fn manager_with(view: Arc<FakeView>, journeys: Vec<Journey>, interval: u64) -> ScenarioManager {
        manager_starting_at(view, journeys, interval, unix_now())
    }

    #[test]
    fn constant_volume_sums_to_target_times_duration() {
        // one node, target 3 for 5 seconds, 1s intervals: 15 spawns total,
        // nothing in the 6th second
        let view = FakeView::new(1, 0);
        let journey = Journey::new("j:one", None, VolumeModel::constant(3, Some(5)));
        let manager = manager_with(view, vec![journey], 1);
        manager.running.store(true, Ordering::Relaxed);

        let mut total = 0u64;
        for index in 0..6 {
            for work in manager.work(index) {
                total += work.subint_volumes.iter().sum::<u64>();
            }
        }
        assert_eq!(total, 15);
        // the journey completed at index 5; the following interval sees a
        // fully-complete scenario and halts the manager
        assert!(manager.work(6).is_empty());
        assert!(!manager.is_running());
    }

    #[test]
    fn work_is_empty_with_no_known_nodes() {
        let view = Arc::new(FakeView {
            identity: "lonely".to_string(),
            count: 0,
            index: None,
            state: StateStore::new(),
        });
        let journey = Journey::new("j:one", None, VolumeModel::constant(3, None));
        let manager = manager_with(view, vec![journey], 1);
        assert!(manager.work(0).is_empty());
    }

    #[test]
    fn datapool_items_are_disjoint_across_nodes() {
        // three nodes, one journey, 10/s for 4 seconds, a 40-item pool:
        // every item is dispensed exactly once across the cluster
        let node_count = 3;
        let items: Vec<String> = (0..40).map(|i| format!("item-{i}")).collect();
        let mut seen: Vec<String> = Vec::new();

        let managers: Vec<ScenarioManager> = (0..node_count)
            .map(|index| {
                let pool: stampede_types::SharedDatapool =
                    Arc::new(PlMutex::new(IterableDatapool::new(items.clone())));
                let journey = Journey::new(
                    "j:data",
                    Some(pool),
                    VolumeModel::constant(10, Some(4)),
                );
                manager_with(FakeView::new(node_count, index), vec![journey], 1)
            })
            .collect();

        for index in 0..5 {
            for manager in &managers {
                for work in manager.work(index) {
                    if let Some(data) = work.data {
                        seen.extend(data);
                    }
                }
            }
        }

        seen.sort();
        let mut expected = items.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn late_joiner_fast_forwards_the_cursor() {
        // a single node joining at work index 2 must not re-serve the 10
        // items the cluster already dispensed
        let pool: stampede_types::SharedDatapool = Arc::new(PlMutex::new(IterableDatapool::new(
            (0..100).map(|i| format!("item-{i}")),
        )));
        let journey = Journey::new(
            "j:data",
            Some(Arc::clone(&pool)),
            VolumeModel::constant(5, None),
        );
        let manager = manager_with(FakeView::new(1, 0), vec![journey], 1);

        let mut work = manager.work(2);
        assert_eq!(work.len(), 1);
        let items: Vec<String> = work.remove(0).data.unwrap().collect();
        assert_eq!(
            items,
            vec!["item-10", "item-11", "item-12", "item-13", "item-14"]
        );
        // cursor advanced by the cluster total, past the checked-out slice
        assert_eq!(pool.lock().cursor(), 15);
    }

    #[test]
    fn exhausted_pool_yields_an_empty_slice() {
        let pool: stampede_types::SharedDatapool = Arc::new(PlMutex::new(IterableDatapool::new(
            (0..3).map(|i| format!("item-{i}")),
        )));
        let journey = Journey::new(
            "j:data",
            Some(Arc::clone(&pool)),
            VolumeModel::constant(5, None),
        );
        let manager = manager_with(FakeView::new(1, 0), vec![journey], 1);

        let mut first = manager.work(0);
        let items: Vec<String> = first.remove(0).data.unwrap().collect();
        assert_eq!(items.len(), 3);

        let mut second = manager.work(1);
        let items: Vec<String> = second.remove(0).data.unwrap().collect();
        assert!(items.is_empty());
    }

    #[test]
    fn completed_journeys_are_skipped_in_later_intervals() {
        let view = FakeView::new(1, 0);
        let short = Journey::new("j:short", None, VolumeModel::constant(1, Some(1)));
        let long = Journey::new("j:long", None, VolumeModel::constant(1, Some(10)));
        let manager = manager_with(view, vec![short, long], 1);
        manager.running.store(true, Ordering::Relaxed);

        assert_eq!(manager.work(0).len(), 2);
        // j:short completed at index 1; only j:long remains afterwards
        let second = manager.work(1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].journey_spec, "j:long");
        assert!(manager.is_running());
    }

    #[tokio::test]
    async fn resolve_loop_spawns_the_full_volume() {
        // real-time smoke test: target 2 for 2 seconds on 1s intervals,
        // starting one second from now so work index 0 gets resolved
        let view = FakeView::new(1, 0);
        let journey = Journey::new("j:one", None, VolumeModel::constant(2, Some(2)));
        let manager = Arc::new(manager_starting_at(view, vec![journey], 1, unix_now() + 1.0));

        let handle = tokio::spawn(Arc::clone(&manager).resolve_loop());
        let deadline = Instant::now() + Duration::from_secs(8);
        while manager.total_spawned() < 4 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(manager.total_spawned(), 4);

        // the scenario completes and the loop winds down on its own
        let deadline = Instant::now() + Duration::from_secs(8);
        while manager.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!manager.is_running());
        manager.cancel_tasks().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn journey_metrics_are_recorded() {
        let view = FakeView::new(1, 0);
        let failing: JourneyFn = Arc::new(|_context, _item| {
            Box::pin(async { Err(crate::journey::JourneyError::new("TestError", "boom")) })
        });
        let mut journey_fns: HashMap<String, JourneyFn> = HashMap::new();
        journey_fns.insert("j:fail".to_string(), failing);
        let resolved = ResolvedScenario {
            scenario: Scenario::new(vec![Journey::new(
                "j:fail",
                None,
                VolumeModel::constant(1, Some(1)),
            )])
            .with_interval(1)
            .with_delay(0),
            journeys: journey_fns,
        };
        let collector = Arc::new(MetricCollector::new());
        let manager = Arc::new(ScenarioManager::new(
            view,
            Arc::clone(&collector),
            "test:scenario",
            unix_now(),
            resolved,
        ));

        for work in manager.work(0) {
            Arc::clone(&manager).spawn_journeys(work).await;
        }
        manager.cancel_tasks().await;

        let snap = collector.snapshot(false);
        assert_eq!(
            snap.counters["journey_executions_total"].samples[0].value,
            1.0
        );
        let failure = &snap.counters["journey_failures_total"].samples[0];
        assert_eq!(failure.labels["error"], "TestError");
        assert_eq!(failure.labels["scenario"], "test:scenario");
    }
}
