//! Reconciler
//!
//! Owns the configuration and the set of routes believed to be installed,
//! and drives the helper to converge the routing table on the planner's
//! desired state.
//!
//! All passes run on one worker task, so route mutations never interleave.
//! Callers only enqueue work: a request made while a pass is running marks
//! the queue dirty and the worker runs once more afterwards. Repeated
//! requests of one kind collapse into a single pass. A queued removal is
//! never dropped: an apply requested after it runs once the removal is
//! done, and a removal requested after an apply supersedes it.
//! Configuration mutations take the state lock briefly and never wait for
//! a pass.

pub mod log;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backoff::calculate_backoff;
use crate::config::{ConfigError, ConfigStore, Configuration, DomainEntry, normalize_entry};
use crate::network::NetworkSnapshot;
use crate::rpc::{HELPER_VERSION, PrivilegedOps, RpcError};
use crate::state::RouteJournal;
use crate::vpn::hosts::HostsEntry;
use crate::vpn::planner::{self, DesiredState, PlanIssue};
use crate::vpn::resolve::Resolve;
use crate::vpn::route::{ActiveRoute, RouteOrigin, RouteTarget};

pub use log::{ActivityLog, FailureKind, LogEntry, LogLevel};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Not a hostname, address or CIDR: {0:?}")]
    InvalidEntry(String),
    #[error("Already configured: {0}")]
    DuplicateDomain(String),
    #[error("No domain with id {0}")]
    UnknownDomain(String),
    #[error("No service with id {0}")]
    UnknownService(String),
    #[error("Helper reports version {found}, expected {expected}; reinstall the helper")]
    HelperVersionMismatch { expected: String, found: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Planning,
    Applying,
    /// The helper could not be reached or refused us; back to `Idle` after
    /// a cooldown
    Failed,
}

/// Summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
    pub hosts_written: bool,
}

impl PassReport {
    fn changed(&self) -> bool {
        self.added + self.removed > 0 || self.hosts_written
    }
}

/// Published view of the reconciler
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub phase: Phase,
    pub network: NetworkSnapshot,
    pub config: Configuration,
    pub active_routes: Vec<ActiveRoute>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_report: Option<PassReport>,
}

pub struct ReconcilerOptions {
    pub log_capacity: usize,
    pub journal: Option<RouteJournal>,
    /// Connection attempts at the start of a pass before giving up
    pub connect_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            log_capacity: 100,
            journal: None,
            connect_attempts: 3,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    Apply,
    RemoveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Unreachable,
    Denied,
}

struct State {
    config: Configuration,
    network: NetworkSnapshot,
    active: BTreeMap<RouteTarget, ActiveRoute>,
    /// Last hosts block the helper confirmed; `None` when unknown
    hosts_pushed: Option<BTreeSet<HostsEntry>>,
    phase: Phase,
    log: ActivityLog,
    last_update: Option<DateTime<Utc>>,
    last_report: Option<PassReport>,
}

impl State {
    fn status(&self) -> Status {
        Status {
            phase: self.phase,
            network: self.network.clone(),
            config: self.config.clone(),
            active_routes: self.active.values().cloned().collect(),
            last_update: self.last_update,
            last_report: self.last_report.clone(),
        }
    }

    fn hosts_clean(&self) -> bool {
        self.hosts_pushed.as_ref().is_some_and(BTreeSet::is_empty)
    }
}

/// Pending passes, each tagged with the request number it settles
#[derive(Default)]
struct Queue {
    remove_all: Option<u64>,
    apply: Option<u64>,
    requested: u64,
    shutting_down: bool,
    failures: u32,
}

impl Queue {
    fn push(&mut self, kind: PassKind, ticket: u64) {
        match kind {
            PassKind::RemoveAll => {
                self.apply = None;
                self.remove_all = Some(ticket);
            }
            PassKind::Apply => self.apply = Some(ticket),
        }
    }

    /// Removal first; any apply still queued was requested after it
    fn take(&mut self) -> Option<(PassKind, u64)> {
        if let Some(ticket) = self.remove_all.take() {
            return Some((PassKind::RemoveAll, ticket));
        }
        self.apply.take().map(|ticket| (PassKind::Apply, ticket))
    }

    fn is_idle(&self) -> bool {
        self.remove_all.is_none() && self.apply.is_none()
    }
}

struct Inner {
    ops: Arc<dyn PrivilegedOps>,
    resolver: Arc<dyn Resolve>,
    store: Arc<dyn ConfigStore>,
    journal: Option<RouteJournal>,
    connect_attempts: u32,
    retry_base: Duration,
    retry_max: Duration,
    state: Mutex<State>,
    queue: StdMutex<Queue>,
    wake: Notify,
    status_tx: watch::Sender<Status>,
    completed_tx: watch::Sender<u64>,
}

/// Handle to the reconciler; cheap to clone
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
    worker: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Reconciler {
    /// Load the configuration, seed the route view from the journal and
    /// start the worker. Must be called inside a Tokio runtime.
    pub fn spawn(
        ops: Arc<dyn PrivilegedOps>,
        resolver: Arc<dyn Resolve>,
        store: Arc<dyn ConfigStore>,
        options: ReconcilerOptions,
    ) -> Result<Self, ReconcileError> {
        let config = store.load()?;
        let mut log = ActivityLog::new(options.log_capacity);
        let mut active = BTreeMap::new();
        let mut hosts_pushed = Some(BTreeSet::new());

        if let Some(journal) = &options.journal {
            match journal.load() {
                Ok(Some(record)) => {
                    for route in record.routes {
                        active.insert(route.target, route);
                    }
                    if record.hosts_written {
                        hosts_pushed = None;
                    }
                    if !active.is_empty() {
                        log.warning(
                            format!("Recovered {} routes left by a previous run", active.len()),
                            None,
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => log.warning(format!("Ignoring unreadable route journal: {}", e), None),
            }
        }

        let state = State {
            config,
            network: NetworkSnapshot::default(),
            active,
            hosts_pushed,
            phase: Phase::Idle,
            log,
            last_update: None,
            last_report: None,
        };
        let (status_tx, _) = watch::channel(state.status());
        let (completed_tx, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            ops,
            resolver,
            store,
            journal: options.journal,
            connect_attempts: options.connect_attempts.max(1),
            retry_base: options.retry_base,
            retry_max: options.retry_max,
            state: Mutex::new(state),
            queue: StdMutex::new(Queue::default()),
            wake: Notify::new(),
            status_tx,
            completed_tx,
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&inner)));
        Ok(Self {
            inner,
            worker: Arc::new(StdMutex::new(Some(worker))),
        })
    }

    /// Queue a pass that plans and converges on the desired state
    pub fn detect_and_apply_routes(&self) {
        self.inner.request(PassKind::Apply, true);
    }

    /// Queue a pass that removes every active route and the hosts block,
    /// whatever the configuration says
    pub fn remove_all_routes(&self) {
        self.inner.request(PassKind::RemoveAll, true);
    }

    /// Wait until every pass requested so far has finished
    pub async fn settle(&self) {
        let target = self.inner.lock_queue().requested;
        let mut rx = self.inner.completed_tx.subscribe();
        let _ = rx.wait_for(|done| *done >= target).await;
    }

    /// Record a network snapshot and react to VPN transitions
    pub async fn update_network_status(&self, snapshot: NetworkSnapshot) {
        let mut state = self.inner.state.lock().await;
        let previous = std::mem::replace(&mut state.network, snapshot.clone());
        let auto_apply = state.config.auto_apply_on_vpn;

        let action = if previous.vpn_connected && !snapshot.vpn_connected {
            state.log.info("VPN disconnected");
            Some(PassKind::RemoveAll)
        } else if snapshot.vpn_connected && !previous.vpn_connected {
            state.log.info(format!(
                "VPN connected on {}",
                snapshot.vpn_interface.as_deref().unwrap_or("unknown interface")
            ));
            auto_apply.then_some(PassKind::Apply)
        } else if snapshot.vpn_connected
            && (previous.local_gateway != snapshot.local_gateway
                || previous.vpn_interface != snapshot.vpn_interface)
        {
            state.log.info(format!(
                "Network changed: gateway {}",
                snapshot
                    .local_gateway
                    .map(|gw| gw.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ));
            auto_apply.then_some(PassKind::Apply)
        } else if !snapshot.vpn_connected && !state.active.is_empty() {
            // Routes recovered from the journal while no VPN is up
            Some(PassKind::RemoveAll)
        } else {
            None
        };

        self.inner.publish(&state);
        drop(state);

        if let Some(kind) = action {
            self.inner.request(kind, true);
        }
    }

    /// Add a hostname, address or CIDR entry
    pub async fn add_domain(&self, input: &str) -> Result<DomainEntry, ReconcileError> {
        let normalized =
            normalize_entry(input).ok_or_else(|| ReconcileError::InvalidEntry(input.trim().to_string()))?;

        let mut state = self.inner.state.lock().await;
        if state.config.has_domain(&normalized) {
            return Err(ReconcileError::DuplicateDomain(normalized));
        }
        let entry = DomainEntry::new(normalized);
        state.config.domains.push(entry.clone());
        state.log.info(format!("Added {}", entry.domain));
        self.inner.commit(state);
        Ok(entry)
    }

    pub async fn remove_domain(&self, id: &str) -> Result<DomainEntry, ReconcileError> {
        let mut state = self.inner.state.lock().await;
        let index = state
            .config
            .domains
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| ReconcileError::UnknownDomain(id.to_string()))?;
        let entry = state.config.domains.remove(index);
        state.log.info(format!("Removed {}", entry.domain));
        self.inner.commit(state);
        Ok(entry)
    }

    pub async fn set_domain_enabled(&self, id: &str, enabled: bool) -> Result<(), ReconcileError> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .config
            .domain_mut(id)
            .ok_or_else(|| ReconcileError::UnknownDomain(id.to_string()))?;
        entry.enabled = enabled;
        let message = format!("{} {}", if enabled { "Enabled" } else { "Disabled" }, entry.domain);
        state.log.info(message);
        self.inner.commit(state);
        Ok(())
    }

    /// Flip a service on or off; returns the new state
    pub async fn toggle_service(&self, id: &str) -> Result<bool, ReconcileError> {
        let mut state = self.inner.state.lock().await;
        let service = state
            .config
            .service_mut(id)
            .ok_or_else(|| ReconcileError::UnknownService(id.to_string()))?;
        service.enabled = !service.enabled;
        let enabled = service.enabled;
        let message = format!("{} {}", if enabled { "Enabled" } else { "Disabled" }, service.name);
        state.log.info(message);
        self.inner.commit(state);
        Ok(enabled)
    }

    pub async fn set_auto_apply(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.config.auto_apply_on_vpn = enabled;
        state.log.info(format!(
            "Auto-apply on VPN {}",
            if enabled { "enabled" } else { "disabled" }
        ));
        self.inner.commit(state);
    }

    /// Toggling hosts management always applies, so the block follows
    pub async fn set_manage_hosts_file(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.config.manage_hosts_file = enabled;
        state.log.info(format!(
            "Hosts file management {}",
            if enabled { "enabled" } else { "disabled" }
        ));
        let auto_apply = state.config.auto_apply_on_vpn;
        self.inner.commit(state);
        if !auto_apply {
            self.inner.request(PassKind::Apply, true);
        }
    }

    /// Ask the helper for its version and refuse to work with a stale one
    pub async fn check_helper_version(&self) -> Result<String, ReconcileError> {
        let found = self.inner.ops.version().await?;
        if found != HELPER_VERSION {
            let mut state = self.inner.state.lock().await;
            state.log.error(
                format!("Helper version {} does not match {}", found, HELPER_VERSION),
                None,
            );
            return Err(ReconcileError::HelperVersionMismatch {
                expected: HELPER_VERSION.to_string(),
                found,
            });
        }
        Ok(found)
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    pub fn status(&self) -> Status {
        self.inner.status_tx.borrow().clone()
    }

    pub async fn recent_logs(&self) -> Vec<LogEntry> {
        self.inner.state.lock().await.log.entries()
    }

    pub async fn active_routes(&self) -> Vec<ActiveRoute> {
        self.inner.state.lock().await.active.values().cloned().collect()
    }

    pub async fn config(&self) -> Configuration {
        self.inner.state.lock().await.config.clone()
    }

    /// Remove everything that was installed, then stop the worker. Further
    /// apply requests are ignored.
    pub async fn shutdown(&self) {
        {
            let mut queue = self.inner.lock_queue();
            queue.shutting_down = true;
            queue.requested += 1;
            let ticket = queue.requested;
            queue.push(PassKind::RemoveAll, ticket);
        }
        self.inner.wake.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut queue = inner.lock_queue();
            match queue.take() {
                Some(next) => Some(next),
                None if queue.shutting_down => break,
                None => None,
            }
        };
        let Some((kind, ticket)) = next else {
            inner.wake.notified().await;
            continue;
        };

        let outcome = match kind {
            PassKind::Apply => inner.apply_pass().await,
            PassKind::RemoveAll => inner.remove_all_pass().await,
        };
        inner.completed_tx.send_if_modified(|done| {
            let advanced = ticket > *done;
            if advanced {
                *done = ticket;
            }
            advanced
        });

        match outcome {
            Outcome::Done => inner.lock_queue().failures = 0,
            Outcome::Unreachable => inner.schedule_retry(kind),
            Outcome::Denied => {}
        }
    }
    debug!("Reconciler worker stopped");
}

fn failure_kind(error: &RpcError) -> Option<FailureKind> {
    match error {
        RpcError::Unreachable(_) => Some(FailureKind::ExecutorUnreachable),
        RpcError::PrivilegeDenied(_) => Some(FailureKind::PrivilegeDenied),
        _ => None,
    }
}

/// Per-pass bookkeeping shared by both pass kinds
#[derive(Default)]
struct PassProgress {
    report: PassReport,
    denied: bool,
    unreachable: bool,
    last_kind: Option<FailureKind>,
}

impl PassProgress {
    fn record_failure(&mut self, error: &RpcError) {
        self.report.failed += 1;
        let kind = failure_kind(error);
        match error {
            RpcError::PrivilegeDenied(_) => self.denied = true,
            RpcError::Unreachable(_) => self.unreachable = true,
            _ => {}
        }
        if kind.is_some() {
            self.last_kind = kind;
        }
    }

    fn outcome(&self) -> Outcome {
        if self.denied {
            Outcome::Denied
        } else if self.unreachable {
            Outcome::Unreachable
        } else {
            Outcome::Done
        }
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, kind: PassKind, counted: bool) {
        {
            let mut queue = self.lock_queue();
            if queue.shutting_down && kind == PassKind::Apply {
                debug!("Ignoring apply request during shutdown");
                return;
            }
            if counted {
                queue.requested += 1;
            }
            let ticket = queue.requested;
            queue.push(kind, ticket);
        }
        self.wake.notify_one();
    }

    fn publish(&self, state: &State) {
        self.status_tx.send_replace(state.status());
    }

    /// Persist and publish a configuration mutation, then queue an apply
    /// when auto-apply is on
    fn commit(&self, state: tokio::sync::MutexGuard<'_, State>) {
        let mut state = state;
        if let Err(e) = self.store.save(&state.config) {
            state.log.warning(format!("Failed to save configuration: {}", e), None);
        }
        self.publish(&state);
        let auto_apply = state.config.auto_apply_on_vpn;
        drop(state);
        if auto_apply {
            self.request(PassKind::Apply, true);
        }
    }

    fn schedule_retry(self: &Arc<Self>, kind: PassKind) {
        let attempt = {
            let mut queue = self.lock_queue();
            if queue.shutting_down {
                return;
            }
            queue.failures = queue.failures.saturating_add(1);
            queue.failures
        };
        let delay = calculate_backoff(
            attempt,
            self.retry_base.as_millis() as u64,
            self.retry_max.as_millis() as u64,
        );
        debug!("Retrying in {:?}", delay);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock().await;
                if state.phase == Phase::Failed {
                    state.phase = Phase::Idle;
                    inner.publish(&state);
                }
            }
            let idle = inner.lock_queue().is_idle();
            if idle {
                inner.request(kind, false);
            }
        });
    }

    async fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock().await;
        state.phase = phase;
        self.publish(&state);
    }

    /// Connect to the helper, retrying with backoff
    async fn connect(&self) -> Result<(), RpcError> {
        let mut attempt = 0;
        loop {
            match self.ops.ensure_connected().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.connect_attempts => {
                    attempt += 1;
                    debug!("Helper connection attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(calculate_backoff(
                        attempt,
                        self.retry_base.as_millis() as u64,
                        self.retry_max.as_millis() as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail_unreachable(&self, error: RpcError, deferred: usize) -> Outcome {
        let mut state = self.state.lock().await;
        let kind = failure_kind(&error).or(Some(FailureKind::ExecutorUnreachable));
        state.log.error(
            format!("Helper unavailable, {} operations deferred: {}", deferred, error),
            kind,
        );
        state.phase = Phase::Failed;
        state.last_update = Some(Utc::now());
        state.last_report = Some(PassReport {
            failed: deferred,
            ..PassReport::default()
        });
        self.publish(&state);
        if matches!(error, RpcError::PrivilegeDenied(_)) {
            Outcome::Denied
        } else {
            Outcome::Unreachable
        }
    }

    async fn apply_pass(&self) -> Outcome {
        let (config, network, active, hosts_pushed) = {
            let mut state = self.state.lock().await;
            state.phase = Phase::Planning;
            self.publish(&state);
            (
                state.config.clone(),
                state.network.clone(),
                state.active.clone(),
                state.hosts_pushed.clone(),
            )
        };

        let desired = planner::plan(&config, &network, self.resolver.as_ref()).await;
        self.absorb_plan(&desired).await;

        let gateway = network.local_gateway;
        let removals: Vec<RouteTarget> = active
            .values()
            .filter(|route| !desired.routes.contains_key(&route.target) || Some(route.gateway) != gateway)
            .map(|route| route.target)
            .collect();
        let additions: Vec<(RouteTarget, RouteOrigin)> = desired
            .routes
            .iter()
            .filter(|(target, _)| !active.contains_key(target) || removals.contains(target))
            .map(|(target, origin)| (*target, origin.clone()))
            .collect();

        let hosts_unchanged = hosts_pushed.as_ref() == Some(&hosts_for(&desired, &active));
        if removals.is_empty() && additions.is_empty() && hosts_unchanged {
            debug!("Routes already converged");
            let mut state = self.state.lock().await;
            state.phase = Phase::Idle;
            state.last_update = Some(Utc::now());
            state.last_report = Some(PassReport::default());
            self.publish(&state);
            return Outcome::Done;
        }

        self.set_phase(Phase::Applying).await;
        if let Err(e) = self.connect().await {
            return self.fail_unreachable(e, removals.len() + additions.len()).await;
        }

        let mut progress = PassProgress::default();
        self.remove_targets(&removals, &mut progress).await;

        if let (Some(gateway), false) = (gateway, progress.denied) {
            self.add_targets(&additions, gateway, &mut progress).await;
        }

        if !progress.denied {
            let wanted = {
                let state = self.state.lock().await;
                hosts_for(&desired, &state.active)
            };
            if hosts_pushed.as_ref() != Some(&wanted) {
                self.push_hosts(wanted, &mut progress).await;
            }
        }

        self.finish_pass(progress, "Routes applied").await
    }

    async fn remove_all_pass(&self) -> Outcome {
        let (targets, hosts_clean) = {
            let state = self.state.lock().await;
            (state.active.keys().copied().collect::<Vec<_>>(), state.hosts_clean())
        };
        if targets.is_empty() && hosts_clean {
            debug!("Nothing to remove");
            return Outcome::Done;
        }

        self.set_phase(Phase::Applying).await;
        if let Err(e) = self.connect().await {
            return self.fail_unreachable(e, targets.len()).await;
        }

        let mut progress = PassProgress::default();
        self.remove_targets(&targets, &mut progress).await;
        if !progress.denied && !hosts_clean {
            self.push_hosts(BTreeSet::new(), &mut progress).await;
        }

        self.finish_pass(progress, "Bypass routes removed").await
    }

    /// Log planner issues and keep fresh resolutions on their entries
    async fn absorb_plan(&self, desired: &DesiredState) {
        let mut state = self.state.lock().await;
        for issue in &desired.issues {
            match issue {
                PlanIssue::Unresolved { domain, reason } => state.log.warning(
                    format!("Could not resolve {}: {}", domain, reason),
                    Some(FailureKind::ResolutionFailure),
                ),
                PlanIssue::FamilyMismatch { domain, ip } => state.log.warning(
                    format!("Skipping {}: {} does not match the gateway address family", domain, ip),
                    None,
                ),
                PlanIssue::Invalid { entry } => {
                    state.log.warning(format!("Skipping invalid entry {:?}", entry), None)
                }
            }
        }
        for entry in &mut state.config.domains {
            if entry.resolved_ip.is_none() {
                if let Some(ip) = desired.resolved.get(&entry.domain) {
                    entry.resolved_ip = Some(*ip);
                }
            }
        }
    }

    async fn remove_targets(&self, targets: &[RouteTarget], progress: &mut PassProgress) {
        for target in targets {
            let result = self.ops.remove_route(target).await;
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    state.active.remove(target);
                    progress.report.removed += 1;
                    state.log.info(format!("Removed route {}", target));
                }
                Err(e) => {
                    progress.record_failure(&e);
                    state
                        .log
                        .error(format!("Failed to remove route {}: {}", target, e), failure_kind(&e));
                }
            }
            self.publish(&state);
            if progress.denied {
                break;
            }
        }
    }

    async fn add_targets(&self, additions: &[(RouteTarget, RouteOrigin)], gateway: IpAddr, progress: &mut PassProgress) {
        for (target, origin) in additions {
            // A failed removal leaves the old route in place
            if self.state.lock().await.active.contains_key(target) {
                continue;
            }
            let result = self.ops.add_route(target, gateway).await;
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    state
                        .active
                        .insert(*target, ActiveRoute::new(*target, gateway, origin.clone()));
                    progress.report.added += 1;
                    state
                        .log
                        .info(format!("Routed {} via {} ({})", target, gateway, origin.label));
                }
                Err(e) => {
                    progress.record_failure(&e);
                    state.log.error(
                        format!("Failed to route {} ({}): {}", target, origin.label, e),
                        failure_kind(&e),
                    );
                }
            }
            self.publish(&state);
            if progress.denied {
                break;
            }
        }
    }

    async fn push_hosts(&self, wanted: BTreeSet<HostsEntry>, progress: &mut PassProgress) {
        let entries: Vec<HostsEntry> = wanted.iter().cloned().collect();
        let result = self.ops.update_hosts_file(&entries).await;
        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                progress.report.hosts_written = true;
                state.hosts_pushed = Some(wanted);
                if entries.is_empty() {
                    state.log.info("Hosts block cleared");
                } else {
                    state.log.info(format!("Hosts block updated ({} entries)", entries.len()));
                }
            }
            Err(e) => {
                state.hosts_pushed = None;
                if matches!(e, RpcError::PrivilegeDenied(_)) {
                    progress.denied = true;
                }
                state.log.warning(
                    format!("Hosts file update failed: {}", e),
                    Some(FailureKind::HostsWriteFailure),
                );
            }
        }
    }

    async fn finish_pass(&self, progress: PassProgress, label: &str) -> Outcome {
        if progress.report.changed() && !progress.denied {
            match self.ops.flush_dns_cache().await {
                Ok(true) => {}
                Ok(false) => self.state.lock().await.log.warning("DNS cache flush failed", None),
                Err(e) => self
                    .state
                    .lock()
                    .await
                    .log
                    .warning(format!("DNS cache flush failed: {}", e), failure_kind(&e)),
            }
        }

        let mut state = self.state.lock().await;
        let report = progress.report.clone();
        let succeeded = report.added + report.removed;
        if report.failed == 0 {
            state.log.success(format!(
                "{}: {} added, {} removed",
                label, report.added, report.removed
            ));
        } else if succeeded > 0 {
            state.log.warning(
                format!(
                    "{} partially: {} added, {} removed, {} failed",
                    label, report.added, report.removed, report.failed
                ),
                Some(FailureKind::PartialApplyFailure),
            );
        } else {
            state.log.error(
                format!("{} failed: {} operations failed", label, report.failed),
                progress.last_kind.or(Some(FailureKind::PartialApplyFailure)),
            );
        }
        if progress.denied {
            state.log.error(
                "Helper refused this user; re-authorize before retrying",
                Some(FailureKind::PrivilegeDenied),
            );
        }

        if let Some(journal) = &self.journal {
            let routes: Vec<ActiveRoute> = state.active.values().cloned().collect();
            let hosts_written = !state.hosts_clean();
            if let Err(e) = journal.save(&routes, hosts_written) {
                state.log.warning(format!("Failed to save route journal: {}", e), None);
            }
        }

        state.phase = if progress.denied { Phase::Failed } else { Phase::Idle };
        state.last_update = Some(Utc::now());
        state.last_report = Some(report);
        self.publish(&state);
        progress.outcome()
    }
}

/// Hosts entries whose address has a host route in `active`
fn hosts_for(desired: &DesiredState, active: &BTreeMap<RouteTarget, ActiveRoute>) -> BTreeSet<HostsEntry> {
    desired
        .hosts_entries
        .iter()
        .filter(|entry| active.contains_key(&RouteTarget::host(entry.ip)))
        .cloned()
        .collect()
}
