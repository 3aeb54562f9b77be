//! Service lifecycle registry
//!
//! Each [`ServiceIdentity`] moves through
//! `Absent -> Starting -> Running -> Stopping -> Absent`. The first caller
//! to find an identity absent owns the start attempt; everyone arriving
//! while it is Starting waits for it. Running services are reference
//! counted, and the last detach schedules a teardown after a grace period.
//!
//! The record map is the only shared state. It is locked only to inspect or
//! transition a record; starts, health checks and teardowns run unlocked.

use super::binding::{alias_env, Binding, ServiceBinding, ServiceBindings};
use super::detach::DetachScheduler;
use super::{ClientId, ServiceHandle, ServiceIdentity, ServiceSpec};
use crate::config::Config;
use crate::error::{CorralError, CorralResult};
use crate::health::{HealthChecker, HealthSettings};
use crate::orchestration::{
    stream_output, OutputStream, OutputTail, ProcessExit, ProcessHandle, Runtime, Signal,
    StartedProcess,
};
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to let output drain after a service exits during startup
const EXIT_OUTPUT_SETTLE: Duration = Duration::from_millis(100);

/// Lifecycle state of a service identity that has a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        })
    }
}

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Delay between the last detach and the actual teardown
    pub detach_grace: Duration,
    /// Network mode handed to the runtime
    pub network: String,
    pub health: HealthSettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            detach_grace: Duration::from_millis(config.services.detach_grace_ms),
            network: config.runtime.network.clone(),
            health: HealthSettings::from(&config.health),
        }
    }
}

/// Point-in-time view of one record
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub identity: ServiceIdentity,
    pub state: ServiceState,
    pub bindings: usize,
    /// Present once Running
    pub handle: Option<ServiceHandle>,
    pub started_at: Option<DateTime<Utc>>,
}

struct Running {
    handle: ServiceHandle,
    bindings: usize,
    /// Bumped on every binding change; a scheduled teardown only proceeds
    /// if the ticket it was issued still matches
    ticket: u64,
    /// Dependency services detached when this one goes away
    dependencies: Vec<ServiceHandle>,
    started_at: DateTime<Utc>,
}

/// Starting and Stopping records carry a receiver whose sender is dropped
/// when the transition finishes
enum Record {
    Starting(watch::Receiver<()>),
    Running(Running),
    Stopping(watch::Receiver<()>),
}

impl Record {
    fn state(&self) -> ServiceState {
        match self {
            Record::Starting(_) => ServiceState::Starting,
            Record::Running(_) => ServiceState::Running,
            Record::Stopping(_) => ServiceState::Stopping,
        }
    }
}

enum StartClaim {
    Own(watch::Sender<()>),
    Wait(watch::Receiver<()>),
}

enum StopClaim {
    Own(Running, Transition),
    Wait(watch::Receiver<()>),
    Nothing,
}

struct RegistryInner {
    runtime: Arc<dyn Runtime>,
    health: HealthChecker,
    scheduler: DetachScheduler,
    network: String,
    records: Mutex<HashMap<ServiceIdentity, Record>>,
    generation: AtomicU64,
}

/// Deduplicating, reference-counting registry of running services
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Create an empty registry starting services on `runtime`
    pub fn new(runtime: Arc<dyn Runtime>, settings: RegistrySettings) -> Self {
        let health = HealthChecker::new(Arc::clone(&runtime), settings.health);
        Self {
            inner: Arc::new(RegistryInner {
                runtime,
                health,
                scheduler: DetachScheduler::new(settings.detach_grace),
                network: settings.network,
                records: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Runtime services are started on
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.inner.runtime
    }

    /// Start the service, or attach to it if already running
    ///
    /// Every successful call adds one binding that the caller must give back
    /// with [`detach`](Self::detach). Failures are never remembered: callers
    /// that were waiting on a failed attempt make their own.
    pub fn start<'a>(
        &'a self,
        identity: &'a ServiceIdentity,
        spec: &'a ServiceSpec,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, CorralResult<ServiceHandle>> {
        // Boxed: dependency starts recurse through here
        self.start_inner(identity, spec, cancel).boxed()
    }

    async fn start_inner(
        &self,
        identity: &ServiceIdentity,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> CorralResult<ServiceHandle> {
        loop {
            let claim = {
                let mut records = self.inner.records.lock();
                match records.get_mut(identity) {
                    Some(Record::Running(running)) => {
                        running.bindings += 1;
                        running.ticket += 1;
                        debug!(
                            service = %identity,
                            bindings = running.bindings,
                            "attached to running service"
                        );
                        return Ok(running.handle.clone());
                    }
                    Some(Record::Starting(rx)) | Some(Record::Stopping(rx)) => {
                        StartClaim::Wait(rx.clone())
                    }
                    None => {
                        let (tx, rx) = watch::channel(());
                        records.insert(identity.clone(), Record::Starting(rx));
                        StartClaim::Own(tx)
                    }
                }
            };

            match claim {
                StartClaim::Wait(rx) => {
                    debug!(service = %identity, "waiting for in-flight transition");
                    wait_closed(rx, cancel).await?;
                }
                StartClaim::Own(tx) => {
                    let transition = Transition {
                        inner: Arc::clone(&self.inner),
                        identity: identity.clone(),
                        _done: tx,
                    };
                    return self.launch(identity, spec, cancel, transition).await;
                }
            }
        }
    }

    /// Run one start attempt for a Starting record we own
    async fn launch(
        &self,
        identity: &ServiceIdentity,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
        transition: Transition,
    ) -> CorralResult<ServiceHandle> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(service = %identity, generation, "starting service");

        let dependencies = self
            .start_bindings(identity.client, &spec.dependencies, cancel)
            .await
            .map_err(|e| launch_error(identity, "start dependencies of", e))?;

        let mut launch = Launch {
            registry: self.clone(),
            process: None,
            dependencies: dependencies.iter().map(|(_, h)| h.clone()).collect(),
        };

        let env = alias_env(dependencies.iter().map(|(b, h)| (b, h)));
        let exec = spec.exec_spec(identity.full_hostname(), &self.inner.network, env);

        if cancel.is_cancelled() {
            launch.abort().await;
            return Err(CorralError::Cancelled);
        }

        // On cancel the start keeps running detached and is reaped
        let runtime = Arc::clone(&self.inner.runtime);
        let mut pending = tokio::spawn(async move { runtime.start(&exec).await });
        let outcome = tokio::select! {
            joined = &mut pending => Some(joined),
            _ = cancel.cancelled() => None,
        };

        let started = match outcome {
            Some(Ok(Ok(started))) => started,
            Some(Ok(Err(e))) => {
                launch.abort().await;
                return Err(launch_error(identity, "start", e));
            }
            Some(Err(e)) => {
                launch.abort().await;
                return Err(launch_error(
                    identity,
                    "start",
                    CorralError::Internal(format!("start task failed: {}", e)),
                ));
            }
            None => {
                info!(service = %identity, "start cancelled");
                reap_abandoned_start(Arc::clone(&self.inner.runtime), pending);
                launch.abort().await;
                return Err(CorralError::Cancelled);
            }
        };
        let process = started.handle.clone();
        launch.process = Some(process.clone());

        let tail = OutputTail::new();
        let drain = spawn_drain(
            identity.hostname.clone(),
            started.stdout,
            started.stderr,
            tail.clone(),
        );
        let mut exited = started.exited;

        let probe = spec.probe();
        let checked = tokio::select! {
            result = self.inner.health.check(&process, &probe, cancel) => result,
            exit = &mut exited => {
                let _ = tokio::time::timeout(EXIT_OUTPUT_SETTLE, drain).await;
                let code = match exit {
                    Ok(exit) => exit.describe(),
                    Err(_) => "unknown".to_string(),
                };
                Err(CorralError::ServiceExited {
                    code,
                    output: tail.render(),
                })
            }
        };

        if let Err(e) = checked {
            warn!(service = %identity, "service failed to start: {}", e);
            launch.abort().await;
            return Err(launch_error(identity, "health check", e));
        }

        if cancel.is_cancelled() {
            info!(service = %identity, "start cancelled after health check");
            launch.abort().await;
            return Err(CorralError::Cancelled);
        }

        let handle = ServiceHandle {
            identity: identity.clone(),
            process,
            ports: spec.ports.clone(),
            generation,
        };

        self.inner.records.lock().insert(
            identity.clone(),
            Record::Running(Running {
                handle: handle.clone(),
                bindings: 1,
                ticket: 0,
                dependencies: launch.disarm(),
                started_at: Utc::now(),
            }),
        );
        drop(transition);

        self.watch_exit(handle.clone(), exited);
        info!(service = %identity, process = %handle.process, "service running");
        Ok(handle)
    }

    /// Start every binding concurrently
    ///
    /// If any start fails, the ones that succeeded are detached again and
    /// the first failure is returned.
    async fn start_bindings(
        &self,
        client: ClientId,
        bindings: &ServiceBindings,
        cancel: &CancellationToken,
    ) -> CorralResult<Vec<(ServiceBinding, ServiceHandle)>> {
        if bindings.is_empty() {
            return Ok(Vec::new());
        }

        let targets = bindings
            .iter()
            .map(|b| ServiceIdentity::new(b.hostname.clone(), client).map(|id| (b, id)))
            .collect::<CorralResult<Vec<_>>>()?;

        let results = join_all(targets.iter().map(|(binding, identity)| async move {
            self.start(identity, &binding.service, cancel)
                .await
                .map_err(|source| CorralError::ServiceStart {
                    hostname: binding.hostname.clone(),
                    aliases: binding.aliases.to_string(),
                    source: Box::new(source),
                })
        }))
        .await;

        let mut started = Vec::with_capacity(results.len());
        let mut first_error = None;
        for ((binding, _), result) in targets.iter().zip(results) {
            match result {
                Ok(handle) => started.push(((*binding).clone(), handle)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                for (_, handle) in &started {
                    self.detach_logged(handle);
                }
                Err(e)
            }
            None => Ok(started),
        }
    }

    /// Start all `bindings` for `client` and keep them attached until the
    /// returned [`Binding`] is released or dropped
    pub async fn bind(
        &self,
        client: ClientId,
        bindings: &ServiceBindings,
        cancel: &CancellationToken,
    ) -> CorralResult<Binding> {
        let started = self.start_bindings(client, bindings, cancel).await?;
        Ok(Binding::new(self.clone(), started))
    }

    /// Run `f` with `bindings` started, releasing them afterwards
    pub async fn with_services<F, Fut, T>(
        &self,
        client: ClientId,
        bindings: &ServiceBindings,
        cancel: &CancellationToken,
        f: F,
    ) -> CorralResult<T>
    where
        F: FnOnce(Vec<(ServiceBinding, ServiceHandle)>) -> Fut,
        Fut: Future<Output = CorralResult<T>>,
    {
        let binding = self.bind(client, bindings, cancel).await?;
        let result = f(binding.bound().to_vec()).await;
        binding.release();
        result
    }

    /// Give back one binding
    ///
    /// When the count reaches zero, teardown is scheduled after the grace
    /// period. Handles from an instance that no longer exists are ignored.
    pub fn detach(&self, handle: &ServiceHandle) -> CorralResult<()> {
        let ticket = {
            let mut records = self.inner.records.lock();
            match records.get_mut(&handle.identity) {
                Some(Record::Running(running))
                    if running.handle.generation == handle.generation =>
                {
                    if running.bindings == 0 {
                        return Err(CorralError::Internal(format!(
                            "detach of {} with no bindings",
                            handle.identity
                        )));
                    }
                    running.bindings -= 1;
                    running.ticket += 1;
                    if running.bindings > 0 {
                        debug!(
                            service = %handle.identity,
                            bindings = running.bindings,
                            "detached"
                        );
                        return Ok(());
                    }
                    running.ticket
                }
                _ => {
                    debug!(service = %handle.identity, "detach of stale handle ignored");
                    return Ok(());
                }
            }
        };

        let registry = self.clone();
        let identity = handle.identity.clone();
        let generation = handle.generation;
        self.inner.scheduler.schedule(&identity.to_string(), async move {
            registry.expire(&identity, generation, ticket).await;
        });
        Ok(())
    }

    pub(crate) fn detach_logged(&self, handle: &ServiceHandle) {
        if let Err(e) = self.detach(handle) {
            warn!(service = %handle.identity, "detach failed: {}", e);
        }
    }

    /// Forcibly stop the service regardless of its binding count
    ///
    /// If the instance is already stopping, waits for that teardown. A
    /// handle whose instance is gone is a no-op.
    pub async fn stop(&self, handle: &ServiceHandle) -> CorralResult<()> {
        let generation = handle.generation;
        match self.claim_stop(&handle.identity, |r| r.handle.generation == generation) {
            StopClaim::Own(running, transition) => {
                info!(service = %handle.identity, "stopping service");
                let result = self.teardown(running).await;
                drop(transition);
                result
            }
            StopClaim::Wait(rx) => wait_closed(rx, &CancellationToken::new()).await,
            StopClaim::Nothing => Ok(()),
        }
    }

    /// Stop every running service
    pub async fn shutdown(&self) -> CorralResult<()> {
        let handles: Vec<ServiceHandle> = self
            .inner
            .records
            .lock()
            .values()
            .filter_map(|record| match record {
                Record::Running(running) => Some(running.handle.clone()),
                _ => None,
            })
            .collect();

        info!("Shutting down {} service(s)", handles.len());
        let results = join_all(handles.iter().map(|h| self.stop(h))).await;
        results.into_iter().collect::<CorralResult<Vec<()>>>()?;
        Ok(())
    }

    /// Current state of an identity, `None` when absent
    pub fn state(&self, identity: &ServiceIdentity) -> Option<ServiceState> {
        self.inner.records.lock().get(identity).map(Record::state)
    }

    /// Number of bindings on a running service, 0 otherwise
    pub fn binding_count(&self, identity: &ServiceIdentity) -> usize {
        match self.inner.records.lock().get(identity) {
            Some(Record::Running(running)) => running.bindings,
            _ => 0,
        }
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<ServiceRecord> {
        let records = self.inner.records.lock();
        let mut snapshot: Vec<ServiceRecord> = records
            .iter()
            .map(|(identity, record)| {
                let (bindings, handle, started_at) = match record {
                    Record::Running(r) => (r.bindings, Some(r.handle.clone()), Some(r.started_at)),
                    _ => (0, None, None),
                };
                ServiceRecord {
                    identity: identity.clone(),
                    state: record.state(),
                    bindings,
                    handle,
                    started_at,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.identity.hostname.cmp(&b.identity.hostname));
        snapshot
    }

    /// Move a Running record that satisfies `predicate` to Stopping
    fn claim_stop(
        &self,
        identity: &ServiceIdentity,
        predicate: impl FnOnce(&Running) -> bool,
    ) -> StopClaim {
        let mut records = self.inner.records.lock();
        let running = match records.remove(identity) {
            Some(Record::Running(running)) if predicate(&running) => running,
            Some(Record::Stopping(rx)) => {
                let wait = rx.clone();
                records.insert(identity.clone(), Record::Stopping(rx));
                return StopClaim::Wait(wait);
            }
            Some(other) => {
                records.insert(identity.clone(), other);
                return StopClaim::Nothing;
            }
            None => return StopClaim::Nothing,
        };

        let (tx, rx) = watch::channel(());
        records.insert(identity.clone(), Record::Stopping(rx));
        StopClaim::Own(
            running,
            Transition {
                inner: Arc::clone(&self.inner),
                identity: identity.clone(),
                _done: tx,
            },
        )
    }

    /// Kill and release a service we moved to Stopping, then detach its
    /// dependencies
    async fn teardown(&self, running: Running) -> CorralResult<()> {
        let result = kill_and_release(self.inner.runtime.as_ref(), &running.handle.process).await;
        for dep in &running.dependencies {
            self.detach_logged(dep);
        }
        info!(service = %running.handle.identity, "service stopped");
        result
    }

    /// Scheduled teardown; a no-op if the service was reattached meanwhile
    async fn expire(&self, identity: &ServiceIdentity, generation: u64, ticket: u64) {
        let claim = self.claim_stop(identity, |r| {
            r.handle.generation == generation && r.bindings == 0 && r.ticket == ticket
        });
        match claim {
            StopClaim::Own(running, transition) => {
                if let Err(e) = self.teardown(running).await {
                    warn!(service = %identity, "teardown failed: {}", e);
                }
                drop(transition);
            }
            _ => debug!(service = %identity, "teardown skipped, service reattached"),
        }
    }

    /// Spawn the watcher that tears down a service that exits on its own
    fn watch_exit(&self, handle: ServiceHandle, exited: oneshot::Receiver<ProcessExit>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let exit = exited.await.ok();
            let generation = handle.generation;
            let claim = registry.claim_stop(&handle.identity, |r| r.handle.generation == generation);
            if let StopClaim::Own(running, transition) = claim {
                let code = exit.map(|e| e.describe()).unwrap_or_else(|| "unknown".to_string());
                warn!(service = %handle.identity, code = %code, "service exited");
                if let Err(e) = registry.teardown(running).await {
                    warn!(service = %handle.identity, "teardown failed: {}", e);
                }
                drop(transition);
            }
        });
    }
}

/// Owner of a Starting or Stopping record
///
/// Dropping it removes the record, unless it has become Running, and then
/// wakes every waiter.
struct Transition {
    inner: Arc<RegistryInner>,
    identity: ServiceIdentity,
    _done: watch::Sender<()>,
}

impl Drop for Transition {
    fn drop(&mut self) {
        let mut records = self.inner.records.lock();
        if matches!(
            records.get(&self.identity),
            Some(Record::Starting(_)) | Some(Record::Stopping(_))
        ) {
            records.remove(&self.identity);
        }
    }
}

/// Resources acquired by an in-progress start, released on every failure path
struct Launch {
    registry: ServiceRegistry,
    process: Option<ProcessHandle>,
    dependencies: Vec<ServiceHandle>,
}

impl Launch {
    /// Hand the dependencies over to the Running record
    fn disarm(&mut self) -> Vec<ServiceHandle> {
        self.process = None;
        std::mem::take(&mut self.dependencies)
    }

    async fn abort(&mut self) {
        if let Some(process) = self.process.take() {
            if let Err(e) = kill_and_release(self.registry.inner.runtime.as_ref(), &process).await {
                warn!(process = %process, "cleanup after failed start: {}", e);
            }
        }
        for dep in self.dependencies.drain(..) {
            self.registry.detach_logged(&dep);
        }
    }
}

impl Drop for Launch {
    fn drop(&mut self) {
        for dep in self.dependencies.drain(..) {
            self.registry.detach_logged(&dep);
        }
        if let Some(process) = self.process.take() {
            let runtime = Arc::clone(&self.registry.inner.runtime);
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(async move {
                        if let Err(e) = kill_and_release(runtime.as_ref(), &process).await {
                            warn!(process = %process, "cleanup after abandoned start: {}", e);
                        }
                    });
                }
                Err(_) => warn!(process = %process, "abandoned start left running"),
            }
        }
    }
}

/// Attach the service and the failed step to a start error
///
/// Cancellation passes through unchanged so callers can still match on it.
fn launch_error(
    identity: &ServiceIdentity,
    phase: &'static str,
    source: CorralError,
) -> CorralError {
    match source {
        CorralError::Cancelled => source,
        source => CorralError::ServiceLaunch {
            service: identity.to_string(),
            phase,
            source: Box::new(source),
        },
    }
}

/// Release a resource whose start finishes after its caller gave up
fn reap_abandoned_start(
    runtime: Arc<dyn Runtime>,
    pending: JoinHandle<CorralResult<StartedProcess>>,
) {
    tokio::spawn(async move {
        if let Ok(Ok(started)) = pending.await {
            if let Err(e) = kill_and_release(runtime.as_ref(), &started.handle).await {
                warn!(process = %started.handle, "cleanup after cancelled start: {}", e);
            }
        }
    });
}

async fn kill_and_release(runtime: &dyn Runtime, process: &ProcessHandle) -> CorralResult<()> {
    let killed = runtime.signal(process, Signal::Kill).await;
    let released = runtime.release(process).await;
    killed.and(released)
}

/// Wait until the sender side of `rx` is dropped
async fn wait_closed(mut rx: watch::Receiver<()>, cancel: &CancellationToken) -> CorralResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CorralError::Cancelled),
        _ = async { while rx.changed().await.is_ok() {} } => Ok(()),
    }
}

fn spawn_drain(
    hostname: String,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    tail: OutputTail,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let on_output = move |line: String| {
            debug!(service = %hostname, "{}", line);
            tail.push(line);
        };
        stream_output(stdout, stderr, &on_output).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthcheckConfig;
    use crate::orchestration::MockRuntime;
    use crate::service::Port;
    use std::time::Instant;

    const GRACE: Duration = Duration::from_millis(50);

    fn settings() -> RegistrySettings {
        RegistrySettings {
            detach_grace: GRACE,
            network: "bridge".to_string(),
            health: HealthSettings {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(20),
                port_deadline: Some(Duration::from_millis(200)),
                ..HealthSettings::default()
            },
        }
    }

    fn setup(runtime: MockRuntime) -> (Arc<MockRuntime>, ServiceRegistry) {
        let runtime = Arc::new(runtime);
        let registry = ServiceRegistry::new(runtime.clone(), settings());
        (runtime, registry)
    }

    fn service(name: &str) -> (ServiceIdentity, ServiceSpec) {
        let spec = ServiceSpec::new(name, ["serve"]);
        let identity = ServiceIdentity::new(spec.hostname().unwrap(), ClientId::new()).unwrap();
        (identity, spec)
    }

    async fn settle() {
        tokio::time::sleep(GRACE * 3).await;
    }

    #[tokio::test]
    async fn start_counts_bindings() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let first = registry.start(&id, &spec, &cancel).await.unwrap();
        assert_eq!(registry.binding_count(&id), 1);
        let second = registry.start(&id, &spec, &cancel).await.unwrap();
        let third = registry.start(&id, &spec, &cancel).await.unwrap();

        assert_eq!(registry.binding_count(&id), 3);
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(runtime.starts(), 1);
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_instance() {
        let (runtime, registry) = setup(MockRuntime::with_start_delay(Duration::from_millis(50)));
        let (id, spec) = service("postgres");

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    registry.start(&id, &spec, &CancellationToken::new()).await
                })
            })
            .collect();

        let handles: Vec<ServiceHandle> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(runtime.starts(), 1);
        assert_eq!(registry.binding_count(&id), 10);
        assert!(handles.iter().all(|h| h == &handles[0]));
    }

    #[tokio::test]
    async fn clients_never_share_instances() {
        let (runtime, registry) = setup(MockRuntime::new());
        let spec = ServiceSpec::new("redis", ["serve"]);
        let hostname = spec.hostname().unwrap();
        let a = ServiceIdentity::new(hostname.clone(), ClientId::new()).unwrap();
        let b = ServiceIdentity::new(hostname, ClientId::new()).unwrap();
        let cancel = CancellationToken::new();

        let ha = registry.start(&a, &spec, &cancel).await.unwrap();
        let hb = registry.start(&b, &spec, &cancel).await.unwrap();

        assert_ne!(ha.process(), hb.process());
        assert_ne!(ha.full_hostname(), hb.full_hostname());
        assert_eq!(runtime.starts(), 2);
    }

    #[tokio::test]
    async fn last_detach_tears_down_after_grace() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let handle = registry.start(&id, &spec, &cancel).await.unwrap();
        registry.start(&id, &spec, &cancel).await.unwrap();
        registry.start(&id, &spec, &cancel).await.unwrap();

        for _ in 0..3 {
            registry.detach(&handle).unwrap();
        }
        assert_eq!(registry.binding_count(&id), 0);
        // Still up during the grace period
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
        assert_eq!(runtime.kills(), 0);

        settle().await;
        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.kills(), 1);
        assert_eq!(runtime.releases(), 1);
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn reattach_within_grace_keeps_instance() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let handle = registry.start(&id, &spec, &cancel).await.unwrap();
        registry.detach(&handle).unwrap();
        tokio::time::sleep(GRACE / 5).await;
        let again = registry.start(&id, &spec, &cancel).await.unwrap();

        settle().await;
        assert_eq!(again, handle);
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
        assert_eq!(registry.binding_count(&id), 1);
        assert_eq!(runtime.starts(), 1);
        assert_eq!(runtime.kills(), 0);
    }

    #[tokio::test]
    async fn over_detach_is_an_error() {
        let (_runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");

        let handle = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();
        registry.detach(&handle).unwrap();
        assert!(registry.detach(&handle).is_err());
    }

    #[tokio::test]
    async fn failed_start_is_not_cached() {
        let (runtime, registry) = setup(MockRuntime::new());
        runtime.fail_next_starts(1);
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let err = registry.start(&id, &spec, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            CorralError::ServiceLaunch { phase: "start", .. }
        ));
        assert!(matches!(err.root_cause(), CorralError::ContainerStart(_)));
        assert!(err.to_string().contains(&id.full_hostname()));
        assert_eq!(registry.state(&id), None);

        registry.start(&id, &spec, &cancel).await.unwrap();
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn waiter_retries_after_owner_failure() {
        let (runtime, registry) = setup(MockRuntime::with_start_delay(Duration::from_millis(50)));
        runtime.fail_next_starts(1);
        let (id, spec) = service("redis");
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let (a, b) = tokio::join!(registry.start(&id, &spec, &first), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.start(&id, &spec, &second).await
        });

        assert!(a.is_err());
        assert!(b.is_ok());
        assert_eq!(runtime.starts(), 1);
        assert_eq!(registry.binding_count(&id), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_owner_alone() {
        let (runtime, registry) = setup(MockRuntime::with_start_delay(Duration::from_millis(150)));
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let owner_cancel = CancellationToken::new();

        let (owner, waiter) = tokio::join!(
            registry.start(&id, &spec, &owner_cancel),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    trigger.cancel();
                });
                registry.start(&id, &spec, &cancel).await
            }
        );

        assert!(owner.is_ok());
        assert!(waiter.unwrap_err().is_cancelled());
        assert_eq!(runtime.starts(), 1);
        assert_eq!(registry.binding_count(&id), 1);
    }

    #[tokio::test]
    async fn cancel_during_start_aborts_and_reaps() {
        let (runtime, registry) = setup(MockRuntime::with_start_delay(Duration::from_millis(300)));
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = registry.start(&id, &spec, &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(registry.state(&id), None);
        assert_eq!(registry.binding_count(&id), 0);

        // The abandoned start completes in the background and is released
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runtime.starts(), 1);
        assert_eq!(runtime.running(), 0);
        assert_eq!(runtime.releases(), 1);

        registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn already_cancelled_start_never_reaches_runtime() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry.start(&id, &spec, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(runtime.starts(), 0);
        assert_eq!(registry.state(&id), None);
    }

    #[tokio::test]
    async fn health_timeout_reverts_to_absent() {
        let (runtime, registry) = setup(MockRuntime::new());
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let spec = ServiceSpec::new("web", ["serve"]).with_port(Port::tcp(port));
        let id = ServiceIdentity::new(spec.hostname().unwrap(), ClientId::new()).unwrap();

        let err = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CorralError::ServiceLaunch { phase: "health check", .. }
        ));
        assert!(matches!(
            err.root_cause(),
            CorralError::HealthCheckTimeout { .. }
        ));
        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.running(), 0);
        assert_eq!(runtime.releases(), 1);
    }

    #[tokio::test]
    async fn exit_before_healthy_reports_output() {
        let mut mock = MockRuntime::new();
        mock.exit_on_start = Some(3);
        mock.default_exec_code = 1;
        mock.output = vec!["booting".to_string(), "fatal: bad config".to_string()];
        let (_runtime, registry) = setup(mock);

        let spec = ServiceSpec {
            healthcheck: Some(HealthcheckConfig {
                interval_ms: Some(50),
                ..HealthcheckConfig::cmd(["ready"])
            }),
            ..ServiceSpec::new("app", ["serve"])
        };
        let id = ServiceIdentity::new(spec.hostname().unwrap(), ClientId::new()).unwrap();

        let err = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap_err();

        match err.root_cause() {
            CorralError::ServiceExited { code, output } => {
                assert_eq!(code, "3");
                assert!(output.contains("fatal: bad config"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(registry.state(&id), None);
    }

    #[tokio::test]
    async fn crash_is_detected() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");

        let handle = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(runtime.crash(handle.process(), 139));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.releases(), 1);

        // The stale handle is harmless
        registry.detach(&handle).unwrap();
        registry.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn stop_ignores_bindings_and_stale_handles() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let old = registry.start(&id, &spec, &cancel).await.unwrap();
        registry.start(&id, &spec, &cancel).await.unwrap();
        registry.stop(&old).await.unwrap();

        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.kills(), 1);

        let new = registry.start(&id, &spec, &cancel).await.unwrap();
        assert!(new.generation() > old.generation());

        registry.stop(&old).await.unwrap();
        registry.detach(&old).unwrap();
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
        assert_eq!(registry.binding_count(&id), 1);
    }

    fn slow_teardown() -> MockRuntime {
        let mut mock = MockRuntime::new();
        mock.stop_delay = Duration::from_millis(150);
        mock
    }

    #[tokio::test]
    async fn start_during_stopping_waits_then_starts_fresh() {
        let (runtime, registry) = setup(slow_teardown());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let old = registry.start(&id, &spec, &cancel).await.unwrap();
        let stopper = {
            let registry = registry.clone();
            let old = old.clone();
            tokio::spawn(async move { registry.stop(&old).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.state(&id), Some(ServiceState::Stopping));

        let new = registry.start(&id, &spec, &cancel).await.unwrap();
        // Only started once the old instance was fully released
        assert_eq!(runtime.releases(), 1);
        assert_eq!(runtime.starts(), 2);
        assert!(new.generation() > old.generation());
        assert_ne!(new.process(), old.process());
        assert_eq!(registry.binding_count(&id), 1);

        stopper.await.unwrap().unwrap();
        assert_eq!(registry.state(&id), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn stop_during_stopping_waits_for_teardown() {
        let (runtime, registry) = setup(slow_teardown());
        let (id, spec) = service("redis");

        let handle = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();
        let first = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move { registry.stop(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.state(&id), Some(ServiceState::Stopping));

        registry.stop(&handle).await.unwrap();
        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.kills(), 1);
        assert_eq!(runtime.releases(), 1);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_wins_over_scheduled_teardown() {
        let (runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");

        let handle = registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();
        registry.detach(&handle).unwrap();
        registry.stop(&handle).await.unwrap();

        settle().await;
        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.kills(), 1);
        assert_eq!(runtime.releases(), 1);
    }

    #[tokio::test]
    async fn detach_during_stopping_is_ignored() {
        let (runtime, registry) = setup(slow_teardown());
        let (id, spec) = service("redis");
        let cancel = CancellationToken::new();

        let handle = registry.start(&id, &spec, &cancel).await.unwrap();
        registry.start(&id, &spec, &cancel).await.unwrap();
        let stopper = {
            let registry = registry.clone();
            let handle = handle.clone();
            tokio::spawn(async move { registry.stop(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.state(&id), Some(ServiceState::Stopping));

        registry.detach(&handle).unwrap();
        stopper.await.unwrap().unwrap();
        settle().await;

        assert_eq!(registry.state(&id), None);
        assert_eq!(runtime.kills(), 1);
        assert_eq!(runtime.releases(), 1);
    }

    #[tokio::test]
    async fn dependencies_start_first_and_detach_on_stop() {
        let (runtime, registry) = setup(MockRuntime::new());
        let client = ClientId::new();
        let db = ServiceSpec::new("postgres", ["postgres"]).shared();
        let db_binding = ServiceBinding::new(db.clone()).unwrap().with_alias("db");
        let db_id = ServiceIdentity::new(db_binding.hostname.clone(), client).unwrap();

        let mut app = ServiceSpec::new("app", ["serve"]);
        app.dependencies.push(db_binding);
        let app_id = ServiceIdentity::new(app.hostname().unwrap(), client).unwrap();

        let handle = registry
            .start(&app_id, &app, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(runtime.starts(), 2);
        assert_eq!(registry.binding_count(&db_id), 1);
        let specs = runtime.started_specs();
        let app_exec = specs.last().unwrap();
        assert_eq!(
            app_exec.env.get("CORRAL_HOSTNAME_ALIAS_db"),
            Some(&db_id.full_hostname())
        );

        registry.stop(&handle).await.unwrap();
        assert_eq!(registry.binding_count(&db_id), 0);
        settle().await;
        assert_eq!(registry.state(&db_id), None);
    }

    #[tokio::test]
    async fn bind_detaches_survivors_on_failure() {
        let (runtime, registry) = setup(MockRuntime::new());
        let client = ClientId::new();
        let bindings: ServiceBindings = [
            ServiceBinding::new(ServiceSpec::new("redis", ["a"]).shared()).unwrap(),
            ServiceBinding::new(ServiceSpec::new("nats", ["b"]).shared()).unwrap(),
        ]
        .into_iter()
        .collect();

        runtime.fail_next_starts(1);
        let err = registry
            .bind(client, &bindings, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::ServiceStart { .. }));

        settle().await;
        assert!(registry.records().is_empty());
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn binding_drop_detaches() {
        let (_runtime, registry) = setup(MockRuntime::new());
        let client = ClientId::new();
        let redis = ServiceBinding::new(ServiceSpec::new("redis", ["a"]).shared())
            .unwrap()
            .with_alias("cache");
        let id = ServiceIdentity::new(redis.hostname.clone(), client).unwrap();
        let bindings: ServiceBindings = [redis].into_iter().collect();

        let binding = registry
            .bind(client, &bindings, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(registry.binding_count(&id), 1);
        assert!(binding.by_alias("cache").is_some());
        assert!(binding.env().contains_key("CORRAL_HOSTNAME_ALIAS_cache"));

        drop(binding);
        assert_eq!(registry.binding_count(&id), 0);
    }

    #[tokio::test]
    async fn with_services_releases_after_closure() {
        let (_runtime, registry) = setup(MockRuntime::new());
        let client = ClientId::new();
        let redis = ServiceBinding::new(ServiceSpec::new("redis", ["a"]).shared()).unwrap();
        let id = ServiceIdentity::new(redis.hostname.clone(), client).unwrap();
        let bindings: ServiceBindings = [redis].into_iter().collect();

        let count = registry
            .with_services(client, &bindings, &CancellationToken::new(), |bound| async move {
                Ok(bound.len())
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(registry.binding_count(&id), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let (runtime, registry) = setup(MockRuntime::new());
        let cancel = CancellationToken::new();
        for name in ["a", "b", "c"] {
            let (id, spec) = service(name);
            registry.start(&id, &spec, &cancel).await.unwrap();
        }
        assert_eq!(registry.records().len(), 3);

        registry.shutdown().await.unwrap();
        assert!(registry.records().is_empty());
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn records_snapshot() {
        let (_runtime, registry) = setup(MockRuntime::new());
        let (id, spec) = service("redis");
        registry
            .start(&id, &spec, &CancellationToken::new())
            .await
            .unwrap();

        let records = registry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, id);
        assert_eq!(records[0].state, ServiceState::Running);
        assert_eq!(records[0].bindings, 1);
        assert!(records[0].started_at.is_some());
    }
}
