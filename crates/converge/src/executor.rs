//! Execution engine - converges a resource graph level by level
//!
//! Levels run strictly in order. Members of one level run concurrently on a
//! bounded rayon pool, except resource types flagged serial, which run one
//! at a time after the parallel members. The state store is updated right
//! after each resource succeeds.
//!
//! During apply, state entries that are no longer declared (orphans) are torn
//! down first, dependents before dependencies. A declared resource can never
//! depend on an orphan, so an orphan always goes before any declared resource
//! it used to depend on is replaced.

use crate::context::{CancelToken, NoProgress, ProgressCallback, ProviderContext, ProviderLogger};
use crate::diff::{self, Action, Plan, decide, hydrate};
use crate::error::{Error, ProviderError, ResourceError, Result, StateError};
use crate::graph::Graph;
use crate::provider::{Provider, Registry};
use crate::resource::Resource;
use crate::retry::{LogCallback, with_retry};
use crate::state::{StateEntry, StateStore};
use crate::types::{ExecuteOptions, Operation, Outcome, ResourceOutcome, RunKind, RunResult};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Convergence engine bound to a registry and a state store
pub struct Engine<'a> {
    registry: &'a Registry,
    store: &'a StateStore,
    opts: ExecuteOptions,
    progress: &'a dyn ProgressCallback,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a Registry, store: &'a StateStore) -> Self {
        Self {
            registry,
            store,
            opts: ExecuteOptions::default(),
            progress: &NoProgress,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, opts: ExecuteOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Share a cancellation token, typically one wired to an interrupt handler
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Converge the declared resource set
    ///
    /// Returns `Err` only for graph and state errors; resource failures are
    /// reported in the [`RunResult`].
    pub fn apply(&self, resources: Vec<Resource>) -> Result<RunResult> {
        let mut graph = Graph::build(resources)?;
        self.apply_graph(&mut graph)
    }

    /// Converge an already-built graph, recording per-resource status on it
    pub fn apply_graph(&self, graph: &mut Graph) -> Result<RunResult> {
        let pool = self.pool()?;
        let orphans = self.orphans(graph);
        let levels = graph.levels();

        log::info!(
            "Applying {} resources in {} levels ({} orphaned)",
            graph.len(),
            levels.len(),
            orphans.len()
        );
        self.progress
            .on_run_start(RunKind::Apply, graph.len() + orphans.len());

        let mut result = RunResult::new(RunKind::Apply);
        // id -> failed ancestor that blocks it (a failed node maps to itself)
        let mut failed: HashMap<String, String> = HashMap::new();

        if !orphans.is_empty() && !self.cancel.is_cancelled() {
            log::info!("Destroying {} resources no longer declared", orphans.len());
            let mut orphan_graph = Graph::build(orphans)?;
            self.teardown_graph(&pool, &mut orphan_graph, false, &mut result)?;
        }

        for (index, level) in levels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancel_remaining(&mut result, graph, level);
                continue;
            }

            self.progress.on_level_start(index, level.len());
            log::debug!("Level {index}: {}", level.join(", "));

            let mut runnable = Vec::with_capacity(level.len());
            for id in level {
                let Some(resource) = graph.get(id) else {
                    continue;
                };
                match blocked_by(graph, id, &failed) {
                    Some(by) => {
                        log::warn!("{id}: blocked by failed dependency {by}");
                        self.progress.on_resource_blocked(id, &by);
                        result.push(ResourceOutcome {
                            id: id.clone(),
                            resource_type: resource.resource_type.clone(),
                            outcome: Outcome::Blocked { by: by.clone() },
                            elapsed: Duration::ZERO,
                        });
                        failed.insert(id.clone(), by);
                    }
                    None => runnable.push(resource),
                }
            }

            let outcomes = self.run_level(&pool, runnable, |r| self.apply_one(r))?;
            for o in outcomes {
                if matches!(o.outcome, Outcome::Failed { .. }) {
                    failed.insert(o.id.clone(), o.id.clone());
                }
                result.push(o);
            }
        }

        for o in &result.outcomes {
            graph.set_status(&o.id, o.outcome.status());
        }

        self.finish(result)
    }

    /// Run one resource of an apply
    fn apply_one(&self, declared: &Resource) -> std::result::Result<Outcome, StateError> {
        let id = declared.id.as_str();
        let entry = self.store.find_by_id(id);
        let resource = hydrate(declared, entry.as_ref());
        let ctx = ProviderContext::new(&self.cancel, self.store);

        let mut provider = match self.init_provider(&resource) {
            Ok(p) => p,
            Err(error) => return Ok(failure(error)),
        };

        let action = match decide(&resource, entry.as_ref(), provider.as_ref(), &ctx) {
            Ok(a) => a,
            Err(e) => return Ok(failure(ResourceError::new(Operation::Diff, e))),
        };

        match action {
            Action::Create => {
                log::debug!("{id}: create");
                if let Err(e) = self.retry(id, || provider.create(&ctx)) {
                    return Ok(failure(ResourceError::new(Operation::Create, e)));
                }
                self.record(&resource, provider.as_ref())?;
                Ok(Outcome::Created)
            }
            Action::Replace(reason) => {
                log::info!("{id}: {reason}, replacing");
                if let Some(entry) = &entry
                    && let Err(error) = self.teardown(entry, false)
                {
                    return Ok(failure(error));
                }
                self.store.remove(id)?;

                if let Err(e) = self.retry(id, || provider.create(&ctx)) {
                    return Ok(failure(ResourceError::new(Operation::Create, e)));
                }
                self.record(&resource, provider.as_ref())?;
                Ok(Outcome::Replaced)
            }
            Action::Refresh => {
                log::debug!("{id}: refresh");
                if let Err(e) = self.retry(id, || provider.refresh(&ctx)) {
                    return Ok(failure(ResourceError::new(Operation::Refresh, e)));
                }
                self.record(&resource, provider.as_ref())?;
                Ok(Outcome::Refreshed)
            }
        }
    }

    /// Persist the entry for a resource whose operation just succeeded
    fn record(&self, resource: &Resource, provider: &dyn Provider) -> std::result::Result<(), StateError> {
        let outputs = match provider.outputs() {
            serde_json::Value::Null => resource.outputs.clone(),
            outputs => outputs,
        };
        let checksum = provider.checksum().or_else(|| resource.checksum.clone());
        self.store
            .upsert(StateEntry::from_resource(resource, outputs, checksum))
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Tear down the declared resource set plus any orphaned state entries
    ///
    /// Best-effort: a failed destroy keeps its state entry and is reported,
    /// but never stops teardown of other resources. With `force`, each failed
    /// destroy is retried once through [`Provider::force_destroy`].
    pub fn destroy(&self, resources: Vec<Resource>, force: bool) -> Result<RunResult> {
        let mut declared: Vec<Resource> = resources;
        let ids: BTreeSet<String> = declared.iter().map(|r| r.id.clone()).collect();
        let mut orphans: Vec<Resource> = self
            .store
            .snapshot()
            .resources
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .map(StateEntry::to_resource)
            .collect();
        let all: BTreeSet<String> = ids
            .into_iter()
            .chain(orphans.iter().map(|r| r.id.clone()))
            .collect();
        // Orphan edges may point at entries already gone
        for orphan in &mut orphans {
            orphan.depends_on.retain(|dep| all.contains(dep));
        }
        declared.append(&mut orphans);

        let mut graph = Graph::build(declared)?;
        self.destroy_graph(&mut graph, force)
    }

    /// Tear down every node of a graph that has a state entry
    pub fn destroy_graph(&self, graph: &mut Graph, force: bool) -> Result<RunResult> {
        let pool = self.pool()?;
        log::info!("Destroying {} resources (force: {force})", graph.len());
        self.progress.on_run_start(RunKind::Destroy, graph.len());

        let mut result = RunResult::new(RunKind::Destroy);
        self.teardown_graph(&pool, graph, force, &mut result)?;
        self.finish(result)
    }

    fn teardown_graph(
        &self,
        pool: &rayon::ThreadPool,
        graph: &mut Graph,
        force: bool,
        result: &mut RunResult,
    ) -> Result<()> {
        for (index, level) in graph.destroy_levels().iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancel_remaining(result, graph, level);
                continue;
            }

            self.progress.on_level_start(index, level.len());
            let members: Vec<&Resource> = level.iter().filter_map(|id| graph.get(id)).collect();
            let outcomes = self.run_level(pool, members, |r| self.destroy_one(r, force))?;
            for o in outcomes {
                graph.set_status(&o.id, o.outcome.status());
                result.push(o);
            }
        }
        Ok(())
    }

    fn destroy_one(&self, resource: &Resource, force: bool) -> std::result::Result<Outcome, StateError> {
        let Some(entry) = self.store.find_by_id(&resource.id) else {
            log::debug!("{}: not in state, nothing to destroy", resource.id);
            return Ok(Outcome::Absent);
        };

        match self.teardown(&entry, force) {
            Ok(()) => {
                self.store.remove(&entry.id)?;
                Ok(Outcome::Destroyed)
            }
            Err(error) if error.source == ProviderError::Cancelled => Ok(Outcome::Cancelled),
            Err(error) => {
                log::error!("{}: {error}", entry.id);
                Ok(Outcome::DestroyFailed { error })
            }
        }
    }

    /// Destroy what a state entry describes, using its stored config
    fn teardown(&self, entry: &StateEntry, force: bool) -> std::result::Result<(), ResourceError> {
        let resource = entry.to_resource();
        let mut provider = self.init_provider(&resource)?;
        let ctx = ProviderContext::new(&self.cancel, self.store);

        match self.retry(&entry.id, || provider.destroy(&ctx)) {
            Ok(()) => Ok(()),
            Err(ProviderError::Cancelled) => {
                Err(ResourceError::new(Operation::Destroy, ProviderError::Cancelled))
            }
            Err(e) if force => {
                log::warn!("{}: destroy failed ({e}), forcing", entry.id);
                provider
                    .force_destroy(&ctx)
                    .map_err(|e| ResourceError::new(Operation::Destroy, e))
            }
            Err(e) => Err(ResourceError::new(Operation::Destroy, e)),
        }
    }

    // ========================================================================
    // Preview and lookup
    // ========================================================================

    /// Preview an apply without touching the managed system
    pub fn plan(&self, resources: Vec<Resource>) -> Result<Plan> {
        let graph = Graph::build(resources)?;
        Ok(diff::plan(&graph, self.store, self.registry, &self.cancel))
    }

    /// Ask a resource's provider for the backend objects realizing it
    pub fn lookup(&self, resource: &Resource) -> std::result::Result<Vec<String>, ResourceError> {
        let entry = self.store.find_by_id(&resource.id);
        let resource = hydrate(resource, entry.as_ref());
        let provider = self.init_provider(&resource)?;
        let ctx = ProviderContext::new(&self.cancel, self.store);
        provider
            .lookup(&ctx)
            .map_err(|e| ResourceError::new(Operation::Lookup, e))
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.jobs.max(1))
            .thread_name(|i| format!("converge-worker-{i}"))
            .build()
            .map_err(|e| Error::Pool(e.to_string()))
    }

    /// Run the members of one level and wait for all of them
    ///
    /// A state error stops further members from starting and is returned
    /// once the in-flight ones have finished.
    fn run_level<F>(
        &self,
        pool: &rayon::ThreadPool,
        members: Vec<&Resource>,
        op: F,
    ) -> Result<Vec<ResourceOutcome>>
    where
        F: Fn(&Resource) -> std::result::Result<Outcome, StateError> + Sync,
    {
        let abort: Mutex<Option<StateError>> = Mutex::new(None);
        let aborted = || match abort.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };

        let run = |resource: &Resource| -> ResourceOutcome {
            let started = Instant::now();
            let outcome = if self.cancel.is_cancelled() || aborted() {
                Outcome::Cancelled
            } else {
                self.progress.on_resource_start(&resource.id);
                match op(resource) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::error!("{}: {e}", resource.id);
                        let mut slot = match abort.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        Outcome::Cancelled
                    }
                }
            };

            let outcome = ResourceOutcome {
                id: resource.id.clone(),
                resource_type: resource.resource_type.clone(),
                outcome,
                elapsed: started.elapsed(),
            };
            self.progress.on_resource_complete(&outcome);
            outcome
        };

        let (serial, parallel): (Vec<&Resource>, Vec<&Resource>) = members
            .into_iter()
            .partition(|r| self.registry.is_serial(&r.resource_type));

        let mut outcomes: Vec<ResourceOutcome> =
            pool.install(|| parallel.par_iter().map(|&r| run(r)).collect());
        outcomes.extend(serial.iter().map(|&r| run(r)));

        let abort = match abort.into_inner() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match abort {
            Some(e) => Err(e.into()),
            None => Ok(outcomes),
        }
    }

    fn init_provider(&self, resource: &Resource) -> std::result::Result<Box<dyn Provider>, ResourceError> {
        let mut provider = self
            .registry
            .resolve(resource)
            .map_err(|e| ResourceError::new(Operation::Init, e))?;
        provider
            .init(resource, ProviderLogger::new(&resource.id))
            .map_err(|e| ResourceError::new(Operation::Init, e))?;
        Ok(provider)
    }

    fn retry<T, F>(&self, id: &str, op: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> std::result::Result<T, ProviderError>,
    {
        let callback = LogCallback { resource_id: id };
        with_retry(&self.opts.retry, &self.cancel, Some(&callback), op)
    }

    /// State entries with no declared counterpart, edges pruned to each other
    fn orphans(&self, graph: &Graph) -> Vec<Resource> {
        let snapshot = self.store.snapshot();
        let orphan_ids: BTreeSet<&str> = snapshot
            .ids()
            .filter(|id| !graph.contains(id))
            .collect();
        snapshot
            .resources
            .iter()
            .filter(|e| orphan_ids.contains(e.id.as_str()))
            .map(|e| {
                let mut r = e.to_resource();
                r.depends_on.retain(|dep| orphan_ids.contains(dep.as_str()));
                r
            })
            .collect()
    }

    fn finish(&self, mut result: RunResult) -> Result<RunResult> {
        result.cancelled = self.cancel.is_cancelled();
        self.store.mark_run(result.kind)?;

        let summary = result.summary();
        log::info!(
            "{} complete: {} changed, {} failed, {} blocked{}",
            result.kind,
            summary.total_changes(),
            summary.failed + summary.destroy_failed,
            summary.blocked,
            if result.cancelled { " (cancelled)" } else { "" }
        );

        self.progress.on_run_complete(&result);
        Ok(result)
    }
}

/// Outcome for a failed resource; cancellation is not a failure
fn failure(error: ResourceError) -> Outcome {
    if error.source == ProviderError::Cancelled {
        Outcome::Cancelled
    } else {
        Outcome::Failed { error }
    }
}

/// The failed ancestor blocking `id`, if any
fn blocked_by(graph: &Graph, id: &str, failed: &HashMap<String, String>) -> Option<String> {
    graph.dependencies(id).find_map(|dep| failed.get(dep).cloned())
}

fn cancel_remaining(result: &mut RunResult, graph: &Graph, level: &[String]) {
    for id in level {
        if let Some(resource) = graph.get(id) {
            result.push(ResourceOutcome {
                id: id.clone(),
                resource_type: resource.resource_type.clone(),
                outcome: Outcome::Cancelled,
                elapsed: Duration::ZERO,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::retry::RetryConfig;
    use crate::types::Status;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Shared behaviour and call journal for mock providers
    #[derive(Clone, Default)]
    struct Mock {
        calls: Arc<Mutex<Vec<String>>>,
        /// "create test.a" style keys that fail
        fail: Arc<Mutex<HashSet<String>>>,
        /// "create test.a" style keys -> remaining retryable failures
        flaky: Arc<Mutex<HashMap<String, u32>>>,
        /// IDs whose provider reports external drift
        drifted: Arc<Mutex<HashSet<String>>>,
        /// Cancel this token when the named ID is created
        cancel_on: Arc<Mutex<Option<(String, CancelToken)>>>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl Mock {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, op: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(op)).count()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn fail(&self, key: &str) {
            self.fail.lock().unwrap().insert(key.to_string());
        }

        fn heal(&self, key: &str) {
            self.fail.lock().unwrap().remove(key);
        }

        fn provider(&self) -> Box<dyn Provider> {
            Box::new(MockProvider {
                mock: self.clone(),
                id: String::new(),
                name: String::new(),
            })
        }

        fn registry(&self) -> Registry {
            let m = self.clone();
            let s = self.clone();
            Registry::builder()
                .register("test", move || m.provider())
                .register("index", move || s.provider())
                .serial("index")
                .build()
                .unwrap()
        }
    }

    struct MockProvider {
        mock: Mock,
        id: String,
        name: String,
    }

    impl MockProvider {
        fn call(&self, op: &str) -> std::result::Result<(), ProviderError> {
            let key = format!("{op} {}", self.id);
            self.mock.calls.lock().unwrap().push(key.clone());

            let now = self.mock.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.mock.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.mock.delay);
            self.mock.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(remaining) = self.mock.flaky.lock().unwrap().get_mut(&key)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ProviderError::retryable(format!("{key} not ready")));
            }
            if self.mock.fail.lock().unwrap().contains(&key) {
                return Err(ProviderError::failed(format!("{key} broke")));
            }
            Ok(())
        }
    }

    impl Provider for MockProvider {
        fn init(&mut self, resource: &Resource, _: ProviderLogger) -> std::result::Result<(), ProviderError> {
            self.id = resource.id.clone();
            self.name = resource.name.clone();
            if self.mock.fail.lock().unwrap().contains(&format!("init {}", self.id)) {
                return Err(ProviderError::Config("rejected".into()));
            }
            Ok(())
        }

        fn create(&mut self, ctx: &ProviderContext) -> std::result::Result<(), ProviderError> {
            if let Some((id, token)) = self.mock.cancel_on.lock().unwrap().as_ref()
                && *id == self.id
            {
                token.cancel();
            }
            self.call("create")?;
            ctx.check_cancelled()
        }

        fn destroy(&mut self, _: &ProviderContext) -> std::result::Result<(), ProviderError> {
            self.call("destroy")
        }

        fn force_destroy(&mut self, _: &ProviderContext) -> std::result::Result<(), ProviderError> {
            self.mock.calls.lock().unwrap().push(format!("force {}", self.id));
            Ok(())
        }

        fn refresh(&mut self, _: &ProviderContext) -> std::result::Result<(), ProviderError> {
            self.call("refresh")
        }

        fn changed(&self, _: &ProviderContext) -> std::result::Result<bool, ProviderError> {
            Ok(self.mock.drifted.lock().unwrap().contains(&self.id))
        }

        fn lookup(&self, _: &ProviderContext) -> std::result::Result<Vec<String>, ProviderError> {
            Ok(vec![format!("mock://{}", self.name)])
        }

        fn outputs(&self) -> Value {
            json!({ "address": format!("{}.local", self.name) })
        }
    }

    fn res(name: &str, deps: &[&str]) -> Resource {
        let mut r = Resource::new("test", name).with_config(json!({ "name": name }));
        for d in deps {
            r = r.depends_on(format!("test.{d}"));
        }
        r
    }

    fn fast_opts() -> ExecuteOptions {
        ExecuteOptions {
            jobs: 4,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(5),
            },
        }
    }

    struct Fixture {
        _tmp: TempDir,
        mock: Mock,
        registry: Registry,
        store: StateStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_mock(Mock::default())
        }

        fn with_mock(mock: Mock) -> Self {
            let tmp = TempDir::new().unwrap();
            let store = StateStore::open(tmp.path().join("state.json")).unwrap();
            let registry = mock.registry();
            Self {
                _tmp: tmp,
                mock,
                registry,
                store,
            }
        }

        fn engine(&self) -> Engine<'_> {
            Engine::new(&self.registry, &self.store).with_options(fast_opts())
        }

        fn state_ids(&self) -> Vec<String> {
            self.store.snapshot().ids().map(String::from).collect()
        }
    }

    fn chain() -> Vec<Resource> {
        vec![
            res("workload", &["leaf"]),
            res("leaf", &["ca"]),
            res("ca", &[]),
        ]
    }

    #[test]
    fn test_first_apply_creates_in_level_order() {
        let fx = Fixture::new();
        let result = fx.engine().apply(chain()).unwrap();

        assert!(result.is_success());
        assert_eq!(
            fx.mock.calls(),
            vec!["create test.ca", "create test.leaf", "create test.workload"]
        );
        assert_eq!(result.summary().created, 3);
        assert_eq!(fx.store.snapshot().len(), 3);
        assert_eq!(
            fx.store.find_by_id("test.leaf").unwrap().outputs["address"],
            "leaf.local"
        );
    }

    #[test]
    fn test_second_apply_only_refreshes() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.clear();

        let result = fx.engine().apply(chain()).unwrap();
        assert!(result.is_success());
        assert_eq!(fx.mock.count("create"), 0);
        assert_eq!(fx.mock.count("destroy"), 0);
        assert_eq!(fx.mock.count("refresh"), 3);
        assert_eq!(result.summary().refreshed, 3);
    }

    #[test]
    fn test_config_change_replaces_only_that_resource() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.clear();

        let mut changed = chain();
        changed[2].config = json!({ "name": "ca", "key_size": 4096 });
        let result = fx.engine().apply(changed).unwrap();

        assert_eq!(result.get("test.ca"), Some(&Outcome::Replaced));
        // Dependents are diffed independently
        assert_eq!(result.get("test.leaf"), Some(&Outcome::Refreshed));
        assert_eq!(result.get("test.workload"), Some(&Outcome::Refreshed));
        assert_eq!(
            fx.mock.calls(),
            vec![
                "destroy test.ca",
                "create test.ca",
                "refresh test.leaf",
                "refresh test.workload"
            ]
        );
        assert_eq!(
            fx.store.find_by_id("test.ca").unwrap().config["key_size"],
            4096
        );
    }

    #[test]
    fn test_provider_drift_replaces() {
        let fx = Fixture::new();
        fx.engine().apply(vec![res("build", &[])]).unwrap();
        fx.mock.clear();

        fx.mock.drifted.lock().unwrap().insert("test.build".into());
        let result = fx.engine().apply(vec![res("build", &[])]).unwrap();

        assert_eq!(result.get("test.build"), Some(&Outcome::Replaced));
        assert_eq!(fx.mock.calls(), vec!["destroy test.build", "create test.build"]);
    }

    #[test]
    fn test_failure_blocks_descendants_only() {
        let fx = Fixture::new();
        fx.mock.fail("create test.leaf");

        let mut resources = chain();
        resources.push(res("sibling", &["ca"]));
        let mut graph = Graph::build(resources).unwrap();
        let result = fx.engine().apply_graph(&mut graph).unwrap();

        assert!(!result.is_success());
        assert_eq!(result.get("test.ca"), Some(&Outcome::Created));
        assert_eq!(result.get("test.sibling"), Some(&Outcome::Created));
        assert!(matches!(
            result.get("test.leaf"),
            Some(Outcome::Failed { error }) if error.operation == Operation::Create
        ));
        assert_eq!(
            result.get("test.workload"),
            Some(&Outcome::Blocked {
                by: "test.leaf".into()
            })
        );
        assert_eq!(fx.mock.count("create test.workload"), 0);

        assert_eq!(graph.get("test.leaf").unwrap().status, Status::Failed);
        assert_eq!(graph.get("test.workload").unwrap().status, Status::Blocked);
        assert_eq!(graph.get("test.sibling").unwrap().status, Status::Created);

        let mut ids = fx.state_ids();
        ids.sort();
        assert_eq!(ids, vec!["test.ca", "test.sibling"]);
    }

    #[test]
    fn test_blocking_is_transitive_to_the_root_failure() {
        let fx = Fixture::new();
        fx.mock.fail("create test.ca");

        let result = fx.engine().apply(chain()).unwrap();
        for id in ["test.leaf", "test.workload"] {
            assert_eq!(
                result.get(id),
                Some(&Outcome::Blocked {
                    by: "test.ca".into()
                })
            );
        }
        assert_eq!(result.blocked().count(), 2);
        assert!(fx.state_ids().is_empty());
    }

    #[test]
    fn test_init_failure_is_resource_failure() {
        let fx = Fixture::new();
        fx.mock.fail("init test.ca");

        let result = fx.engine().apply(chain()).unwrap();
        assert!(matches!(
            result.get("test.ca"),
            Some(Outcome::Failed { error }) if error.operation == Operation::Init
        ));
        assert_eq!(result.blocked().count(), 2);
        assert_eq!(fx.mock.count("create"), 0);
    }

    #[test]
    fn test_unknown_type_fails_resource() {
        let fx = Fixture::new();
        let result = fx
            .engine()
            .apply(vec![Resource::new("tunnel", "ingress"), res("other", &[])])
            .unwrap();

        assert!(matches!(
            result.get("tunnel.ingress"),
            Some(Outcome::Failed { error })
                if error.source == ProviderError::UnknownType("tunnel".into())
        ));
        assert_eq!(result.get("test.other"), Some(&Outcome::Created));
    }

    #[test]
    fn test_failed_recreate_leaves_no_stale_entry() {
        let fx = Fixture::new();
        fx.engine().apply(vec![res("ca", &[])]).unwrap();

        fx.mock.fail("create test.ca");
        let mut changed = res("ca", &[]);
        changed.config = json!({ "name": "ca", "rotated": true });
        let result = fx.engine().apply(vec![changed]).unwrap();

        assert!(matches!(result.get("test.ca"), Some(Outcome::Failed { .. })));
        assert!(fx.store.find_by_id("test.ca").is_none());

        // The next run creates from scratch
        fx.mock.heal("create test.ca");
        fx.mock.clear();
        let result = fx.engine().apply(vec![res("ca", &[])]).unwrap();
        assert_eq!(result.get("test.ca"), Some(&Outcome::Created));
    }

    #[test]
    fn test_refresh_failure_blocks_dependents() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.fail("refresh test.leaf");

        let result = fx.engine().apply(chain()).unwrap();
        assert!(matches!(
            result.get("test.leaf"),
            Some(Outcome::Failed { error }) if error.operation == Operation::Refresh
        ));
        assert!(matches!(result.get("test.workload"), Some(Outcome::Blocked { .. })));
        // The earlier entry still describes what exists
        assert!(fx.store.find_by_id("test.leaf").is_some());
    }

    #[test]
    fn test_two_node_destroy_order() {
        let fx = Fixture::new();
        let set = || vec![res("a", &["b"]), res("b", &[])];

        fx.engine().apply(set()).unwrap();
        assert_eq!(fx.mock.calls(), vec!["create test.b", "create test.a"]);
        fx.mock.clear();

        let result = fx.engine().destroy(set(), false).unwrap();
        assert!(result.is_success());
        assert_eq!(fx.mock.calls(), vec!["destroy test.a", "destroy test.b"]);
        assert!(fx.state_ids().is_empty());
        assert_eq!(result.summary().destroyed, 2);
    }

    #[test]
    fn test_destroy_without_state_is_absent() {
        let fx = Fixture::new();
        let result = fx.engine().destroy(chain(), false).unwrap();

        assert!(result.is_success());
        assert_eq!(result.summary().absent, 3);
        assert!(fx.mock.calls().is_empty());
    }

    #[test]
    fn test_destroy_is_best_effort() {
        let fx = Fixture::new();
        let mut resources = chain();
        resources.push(res("other", &[]));
        fx.engine().apply(resources.clone()).unwrap();
        fx.mock.fail("destroy test.leaf");

        let result = fx.engine().destroy(resources, false).unwrap();
        assert!(!result.is_success());
        assert!(matches!(
            result.get("test.leaf"),
            Some(Outcome::DestroyFailed { error }) if error.operation == Operation::Destroy
        ));
        // Teardown carried on past the failure
        assert_eq!(result.get("test.workload"), Some(&Outcome::Destroyed));
        assert_eq!(result.get("test.ca"), Some(&Outcome::Destroyed));
        assert_eq!(result.get("test.other"), Some(&Outcome::Destroyed));
        assert_eq!(fx.state_ids(), vec!["test.leaf"]);
        assert_eq!(result.failed().count(), 1);
    }

    #[test]
    fn test_forced_destroy() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.fail("destroy test.leaf");
        fx.mock.clear();

        let result = fx.engine().destroy(chain(), true).unwrap();
        assert!(result.is_success());
        assert!(fx.mock.calls().contains(&"force test.leaf".to_string()));
        assert_eq!(fx.mock.count("force"), 1);
        assert!(fx.state_ids().is_empty());
    }

    #[test]
    fn test_destroy_uses_stored_config() {
        let fx = Fixture::new();
        fx.engine().apply(vec![res("ca", &[])]).unwrap();

        // Destroying a declared set that has since been edited
        let mut edited = res("ca", &[]);
        edited.config = json!({ "name": "renamed" });
        let result = fx.engine().destroy(vec![edited], false).unwrap();

        assert_eq!(result.get("test.ca"), Some(&Outcome::Destroyed));
        assert!(fx.state_ids().is_empty());
    }

    #[test]
    fn test_destroy_includes_orphans() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.clear();

        // Only the root is still declared; the rest are orphans
        let result = fx.engine().destroy(vec![res("ca", &[])], false).unwrap();
        assert!(result.is_success());
        assert_eq!(
            fx.mock.calls(),
            vec!["destroy test.workload", "destroy test.leaf", "destroy test.ca"]
        );
        assert!(fx.state_ids().is_empty());
    }

    #[test]
    fn test_apply_destroys_orphans() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.clear();

        let result = fx.engine().apply(vec![res("ca", &[])]).unwrap();
        assert!(result.is_success());
        assert_eq!(result.get("test.workload"), Some(&Outcome::Destroyed));
        assert_eq!(result.get("test.leaf"), Some(&Outcome::Destroyed));
        assert_eq!(
            fx.mock.calls(),
            vec!["destroy test.workload", "destroy test.leaf", "refresh test.ca"]
        );
        assert_eq!(fx.state_ids(), vec!["test.ca"]);
    }

    #[test]
    fn test_orphans_go_before_their_replaced_dependency() {
        let fx = Fixture::new();
        fx.engine().apply(chain()).unwrap();
        fx.mock.clear();

        // leaf and workload are dropped while ca's config changes
        let ca = Resource::new("test", "ca").with_config(json!({ "name": "ca", "bits": 4096 }));
        let result = fx.engine().apply(vec![ca]).unwrap();
        assert!(result.is_success());
        assert_eq!(result.get("test.ca"), Some(&Outcome::Replaced));
        assert_eq!(
            fx.mock.calls(),
            vec![
                "destroy test.workload",
                "destroy test.leaf",
                "destroy test.ca",
                "create test.ca",
            ]
        );
        assert_eq!(fx.state_ids(), vec!["test.ca"]);
    }

    #[test]
    fn test_level_barrier() {
        let mock = Mock {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let fx = Fixture::with_mock(mock);

        let result = fx
            .engine()
            .apply(vec![
                res("a", &[]),
                res("b", &[]),
                res("c", &[]),
                res("d", &[]),
                res("top", &["a", "b", "c", "d"]),
            ])
            .unwrap();
        assert!(result.is_success());

        let calls = fx.mock.calls();
        assert_eq!(calls.last().map(String::as_str), Some("create test.top"));
        assert_eq!(calls.len(), 5);
        // The level really ran concurrently
        assert!(fx.mock.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_serial_types_run_one_at_a_time() {
        let mock = Mock {
            delay: Duration::from_millis(10),
            ..Default::default()
        };
        let fx = Fixture::with_mock(mock);

        let resources = (0..4)
            .map(|i| Resource::new("index", format!("doc{i}")))
            .collect();
        let result = fx.engine().apply(resources).unwrap();

        assert!(result.is_success());
        assert_eq!(fx.mock.count("create"), 4);
        assert_eq!(fx.mock.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outputs_visible_to_next_level() {
        struct Reader {
            id: String,
            seen: Arc<Mutex<Option<Value>>>,
        }

        impl Provider for Reader {
            fn init(&mut self, r: &Resource, _: ProviderLogger) -> std::result::Result<(), ProviderError> {
                self.id = r.id.clone();
                Ok(())
            }
            fn create(&mut self, ctx: &ProviderContext) -> std::result::Result<(), ProviderError> {
                if self.id == "test.workload" {
                    *self.seen.lock().unwrap() = ctx.upstream_outputs("test.leaf");
                }
                Ok(())
            }
            fn destroy(&mut self, _: &ProviderContext) -> std::result::Result<(), ProviderError> {
                Ok(())
            }
            fn refresh(&mut self, _: &ProviderContext) -> std::result::Result<(), ProviderError> {
                Ok(())
            }
            fn changed(&self, _: &ProviderContext) -> std::result::Result<bool, ProviderError> {
                Ok(false)
            }
            fn lookup(&self, _: &ProviderContext) -> std::result::Result<Vec<String>, ProviderError> {
                Ok(Vec::new())
            }
            fn outputs(&self) -> Value {
                json!({ "written_by": self.id })
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path().join("state.json")).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&seen);
        let registry = Registry::builder()
            .register("test", move || {
                Box::new(Reader {
                    id: String::new(),
                    seen: Arc::clone(&shared),
                })
            })
            .build()
            .unwrap();

        Engine::new(&registry, &store).apply(chain()).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            Some(json!({ "written_by": "test.leaf" }))
        );
    }

    #[test]
    fn test_retryable_create_is_retried() {
        let fx = Fixture::new();
        fx.mock
            .flaky
            .lock()
            .unwrap()
            .insert("create test.leaf".into(), 2);

        let result = fx.engine().apply(chain()).unwrap();
        assert!(result.is_success());
        assert_eq!(fx.mock.count("create test.leaf"), 3);
    }

    #[test]
    fn test_retry_budget_exhausted_fails() {
        let fx = Fixture::new();
        fx.mock
            .flaky
            .lock()
            .unwrap()
            .insert("create test.ca".into(), 10);

        let result = fx.engine().apply(chain()).unwrap();
        assert!(matches!(
            result.get("test.ca"),
            Some(Outcome::Failed { error }) if error.source.is_retryable()
        ));
        assert_eq!(fx.mock.count("create test.ca"), 3);
    }

    #[test]
    fn test_cancelled_before_start() {
        let fx = Fixture::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = fx.engine().with_cancel(cancel).apply(chain()).unwrap();
        assert!(result.cancelled);
        assert!(!result.is_success());
        assert_eq!(result.summary().cancelled, 3);
        assert!(fx.mock.calls().is_empty());
    }

    #[test]
    fn test_cancel_mid_run_stops_later_levels() {
        let fx = Fixture::new();
        let cancel = CancelToken::new();
        *fx.mock.cancel_on.lock().unwrap() = Some(("test.ca".into(), cancel.clone()));

        let result = fx.engine().with_cancel(cancel).apply(chain()).unwrap();

        assert!(result.cancelled);
        // The in-flight create observed the signal
        assert_eq!(result.get("test.ca"), Some(&Outcome::Cancelled));
        assert_eq!(result.get("test.leaf"), Some(&Outcome::Cancelled));
        assert_eq!(result.get("test.workload"), Some(&Outcome::Cancelled));
        assert_eq!(fx.mock.calls(), vec!["create test.ca"]);
        assert!(fx.state_ids().is_empty());
    }

    #[test]
    fn test_state_error_aborts_run() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = StateStore::open(blocker.join("state.json")).unwrap();
        let mock = Mock::default();
        let registry = mock.registry();

        let err = Engine::new(&registry, &store)
            .with_options(fast_opts())
            .apply(chain())
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
        // Nothing past the first level was attempted
        assert_eq!(mock.calls(), vec!["create test.ca"]);
    }

    #[test]
    fn test_graph_error_runs_nothing() {
        let fx = Fixture::new();
        let err = fx
            .engine()
            .apply(vec![res("a", &["b"]), res("b", &["a"])])
            .unwrap_err();

        assert!(matches!(err, Error::Graph(GraphError::Cycle { .. })));
        assert!(fx.mock.calls().is_empty());
    }

    #[test]
    fn test_state_survives_on_disk_per_resource() {
        let fx = Fixture::new();
        fx.mock.fail("create test.workload");
        fx.engine().apply(chain()).unwrap();

        let on_disk = crate::state::State::load(fx.store.path()).unwrap();
        let mut ids: Vec<&str> = on_disk.ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["test.ca", "test.leaf"]);
        assert_eq!(on_disk.last_run, Some(RunKind::Apply));
    }

    #[test]
    fn test_plan_and_lookup() {
        let fx = Fixture::new();
        fx.engine().apply(vec![res("ca", &[])]).unwrap();
        fx.mock.clear();

        let plan = fx
            .engine()
            .plan(vec![res("ca", &[]), res("leaf", &["ca"])])
            .unwrap();
        assert_eq!(plan.get("test.ca"), Some(&diff::PlannedAction::Refresh));
        assert_eq!(plan.get("test.leaf"), Some(&diff::PlannedAction::Create));
        assert!(fx.mock.calls().is_empty());

        let refs = fx.engine().lookup(&res("ca", &[])).unwrap();
        assert_eq!(refs, vec!["mock://ca"]);
    }
}
