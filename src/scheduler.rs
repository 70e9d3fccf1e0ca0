//! The Scheduler: topologically orders plugins by declared inter-plugin
//! dependencies, respects per-phase mutex reservations, enforces global
//! budgets, and issues ready-to-run tickets.
//!
//! A DAG-aware admission controller: candidates queue for a ticket, and an
//! admission pass run on every enqueue/release picks the largest
//! mutex-disjoint, budget-fitting subset of ready candidates, tie-broken by
//! fewest required mutexes, then largest estimated wall time, then name.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{Phase, PluginStatus};
use crate::error::{EngineError, Result};
use crate::mutex_manager::{MutexManager, Reservation};

/// Global resource budgets.
#[derive(Debug, Clone)]
pub struct Budgets {
    pub max_parallel: usize,
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_load: Option<f64>,
    pub max_parallel_downloads: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_memory_bytes: None,
            max_cpu_load: None,
            max_parallel_downloads: 2,
        }
    }
}

/// A plugin's declared position in the inter-plugin dependency DAG.
#[derive(Debug, Clone)]
pub struct PluginNode {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// Validates the dependency graph is acyclic via Kahn's algorithm
/// and returns the adjacency map on success.
pub fn validate_dag(nodes: &[PluginNode]) -> Result<HashMap<String, Vec<String>>> {
    let adjacency: HashMap<String, Vec<String>> = nodes
        .iter()
        .map(|n| (n.name.clone(), n.dependencies.clone()))
        .collect();

    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.name.as_str(), 0)).collect();
    for n in nodes {
        for dep in &n.dependencies {
            if !adjacency.contains_key(dep) {
                return Err(EngineError::ConfigError(format!(
                    "plugin {} declares unknown dependency {}",
                    n.name, dep
                )));
            }
        }
        *in_degree.get_mut(n.name.as_str()).unwrap() += n.dependencies.len();
    }

    // Kahn's: a plugin is "ready to remove" once all plugins depending on it
    // have been removed is the usual formulation; here edges point from a
    // plugin to its dependencies, so we remove plugins with in-degree 0
    // (no unresolved dependencies) and decrement the in-degree of whoever
    // depends on them.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for n in nodes {
        for dep in &n.dependencies {
            dependents.entry(dep.as_str()).or_default().push(n.name.as_str());
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0usize;
    while let Some(name) = queue.pop() {
        visited += 1;
        if let Some(deps) = dependents.get(name) {
            for dependent in deps {
                let entry = in_degree.get_mut(dependent).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push(dependent);
                }
            }
        }
    }

    if visited != nodes.len() {
        let cyclic: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(EngineError::DependencyCycle(cyclic));
    }

    Ok(adjacency)
}

struct PendingRequest {
    name: String,
    mutexes: BTreeSet<String>,
    estimated_wall_seconds: f64,
    estimated_memory: u64,
    is_download: bool,
    responder: oneshot::Sender<Reservation>,
}

struct AdmissionState {
    running: usize,
    running_downloads: usize,
    memory_in_use: u64,
    held_mutexes: HashSet<String>,
    pending: Vec<PendingRequest>,
    plugin_status: HashMap<String, PluginStatus>,
}

/// Process-singleton handle, cloned into every plugin task.
#[derive(Clone)]
pub struct Scheduler {
    budgets: Budgets,
    mutexes: MutexManager,
    dag: Arc<HashMap<String, Vec<String>>>,
    state: Arc<Mutex<AdmissionState>>,
    status_notify: Arc<tokio::sync::Notify>,
    cancel: CancellationToken,
}

/// Outcome of waiting on a plugin's declared dependencies.
pub enum DependencyOutcome {
    Proceed,
    /// A dependency did not succeed; caller transitions straight to
    /// `Skipped` without ever requesting a ticket.
    SkipDueTo(String),
    Cancelled,
}

/// A granted slot: the caller holds `reservation` for the phase's duration
/// and must call `release` (via `Ticket::release`) on phase exit.
pub struct Ticket {
    scheduler: Scheduler,
    reservation: Reservation,
    mutexes: BTreeSet<String>,
    is_download: bool,
    estimated_memory: u64,
}

impl Ticket {
    pub async fn release(self) {
        self.reservation.release().await;
        let mut state = self.scheduler.state.lock().await;
        state.running = state.running.saturating_sub(1);
        if self.is_download {
            state.running_downloads = state.running_downloads.saturating_sub(1);
        }
        state.memory_in_use = state.memory_in_use.saturating_sub(self.estimated_memory);
        for m in &self.mutexes {
            state.held_mutexes.remove(m);
        }
        drop(state);
        self.scheduler.try_admit().await;
    }
}

impl Scheduler {
    pub fn new(nodes: &[PluginNode], budgets: Budgets, mutexes: MutexManager) -> Result<Self> {
        let dag = validate_dag(nodes)?;
        let plugin_status = nodes
            .iter()
            .map(|n| (n.name.clone(), PluginStatus::Pending))
            .collect();
        Ok(Self {
            budgets,
            mutexes,
            dag: Arc::new(dag),
            state: Arc::new(Mutex::new(AdmissionState {
                running: 0,
                running_downloads: 0,
                memory_in_use: 0,
                held_mutexes: HashSet::new(),
                pending: Vec::new(),
                plugin_status,
            })),
            status_notify: Arc::new(tokio::sync::Notify::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Records a plugin's terminal status so dependents can be gated or
    /// skipped. No-op for non-terminal statuses.
    pub async fn record_status(&self, name: &str, status: PluginStatus) {
        if !status.is_terminal() {
            return;
        }
        let mut state = self.state.lock().await;
        state.plugin_status.insert(name.to_string(), status);
        drop(state);
        self.status_notify.notify_waiters();
    }

    /// Blocks until every dependency of `name` has reached a terminal
    /// status, then reports whether to proceed or skip.
    pub async fn wait_for_dependencies(&self, name: &str) -> DependencyOutcome {
        let deps = self.dag.get(name).cloned().unwrap_or_default();
        loop {
            if self.cancel.is_cancelled() {
                return DependencyOutcome::Cancelled;
            }
            let notified = self.status_notify.notified();
            {
                let state = self.state.lock().await;
                let mut all_terminal = true;
                for dep in &deps {
                    match state.plugin_status.get(dep) {
                        Some(status) if status.is_terminal() => {
                            if !matches!(status, PluginStatus::Success) {
                                return DependencyOutcome::SkipDueTo(dep.clone());
                            }
                        }
                        _ => all_terminal = false,
                    }
                }
                if all_terminal {
                    return DependencyOutcome::Proceed;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return DependencyOutcome::Cancelled,
            }
        }
    }

    /// Requests admission for one (plugin, phase) tuple. Blocks until the
    /// scheduler can fit it within budgets and its mutex set is free.
    pub async fn request_ticket(
        &self,
        name: &str,
        phase: Phase,
        mutex_set: BTreeSet<String>,
        estimated_wall_seconds: f64,
        estimated_memory: u64,
    ) -> Result<Ticket> {
        let (tx, rx) = oneshot::channel();
        let mutexes = mutex_set.clone();
        {
            let mut state = self.state.lock().await;
            state.pending.push(PendingRequest {
                name: name.to_string(),
                mutexes: mutex_set,
                estimated_wall_seconds,
                estimated_memory,
                is_download: phase == Phase::Download,
                responder: tx,
            });
        }
        self.try_admit().await;

        tokio::select! {
            reservation = rx => {
                let reservation = reservation.map_err(|_| EngineError::Cancelled)?;
                Ok(Ticket {
                    scheduler: self.clone(),
                    reservation,
                    mutexes,
                    is_download: phase == Phase::Download,
                    estimated_memory,
                })
            }
            _ = self.cancel.cancelled() => {
                self.remove_pending(name).await;
                Err(EngineError::Cancelled)
            }
        }
    }

    async fn remove_pending(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.pending.retain(|p| p.name != name);
    }

    /// Runs one admission pass: selects the largest mutex-disjoint,
    /// budget-fitting subset of pending requests, tie-broken by
    /// (1) fewer required mutexes, (2) larger estimated wall time, (3)
    /// stable by name.
    async fn try_admit(&self) {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return;
        }

        let mut order: Vec<usize> = (0..state.pending.len()).collect();
        order.sort_by(|&a, &b| {
            let pa = &state.pending[a];
            let pb = &state.pending[b];
            pa.mutexes
                .len()
                .cmp(&pb.mutexes.len())
                .then(
                    pb.estimated_wall_seconds
                        .partial_cmp(&pa.estimated_wall_seconds)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(pa.name.cmp(&pb.name))
        });

        let mut reserved = state.held_mutexes.clone();
        let mut running = state.running;
        let mut running_downloads = state.running_downloads;
        let mut memory_in_use = state.memory_in_use;
        let mut admitted = Vec::new();

        for idx in order {
            let req = &state.pending[idx];
            if running >= self.budgets.max_parallel {
                continue;
            }
            if req.is_download && running_downloads >= self.budgets.max_parallel_downloads {
                continue;
            }
            if let Some(max_mem) = self.budgets.max_memory_bytes {
                if memory_in_use + req.estimated_memory > max_mem {
                    continue;
                }
            }
            if req.mutexes.iter().any(|m| reserved.contains(m)) {
                continue;
            }
            for m in &req.mutexes {
                reserved.insert(m.clone());
            }
            running += 1;
            if req.is_download {
                running_downloads += 1;
            }
            memory_in_use += req.estimated_memory;
            admitted.push(idx);
        }

        if admitted.is_empty() {
            return;
        }

        admitted.sort_unstable_by(|a, b| b.cmp(a));
        let mut granted = Vec::new();
        for idx in admitted {
            let req = state.pending.remove(idx);
            granted.push(req);
        }

        state.running = running;
        state.running_downloads = running_downloads;
        state.memory_in_use = memory_in_use;
        state.held_mutexes = reserved;
        drop(state);

        for req in granted {
            let names = req.mutexes.clone();
            let reservation = self.mutexes.acquire(names).await;
            if req.responder.send(reservation).is_err() {
                warn!("ticket requester for {} vanished before grant", req.name);
            } else {
                info!("granted ticket to {}", req.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> PluginNode {
        PluginNode {
            name: name.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn acyclic_graph_validates() {
        let nodes = vec![node("a", &[]), node("b", &["a"]), node("c", &["a", "b"])];
        assert!(validate_dag(&nodes).is_ok());
    }

    #[test]
    fn cyclic_graph_is_rejected() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        let err = validate_dag(&nodes).unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle(_)));
    }

    #[tokio::test]
    async fn max_parallel_downloads_is_enforced() {
        let nodes = vec![node("a", &[]), node("b", &[]), node("c", &[])];
        let budgets = Budgets {
            max_parallel: 10,
            max_memory_bytes: None,
            max_cpu_load: None,
            max_parallel_downloads: 1,
        };
        let scheduler = Scheduler::new(&nodes, budgets, MutexManager::new()).unwrap();

        let t1 = scheduler
            .request_ticket("a", Phase::Download, BTreeSet::new(), 1.0, 0)
            .await
            .unwrap();

        let scheduler2 = scheduler.clone();
        let second = tokio::spawn(async move {
            scheduler2
                .request_ticket("b", Phase::Download, BTreeSet::new(), 1.0, 0)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!second.is_finished());

        t1.release().await;
        let t2 = second.await.unwrap().unwrap();
        t2.release().await;
    }

    #[tokio::test]
    async fn dependency_failure_skips_dependent() {
        let nodes = vec![node("a", &[]), node("b", &["a"])];
        let scheduler = Scheduler::new(&nodes, Budgets::default(), MutexManager::new()).unwrap();
        scheduler.record_status("a", PluginStatus::Failed).await;
        let outcome = scheduler.wait_for_dependencies("b").await;
        assert!(matches!(outcome, DependencyOutcome::SkipDueTo(_)));
    }
}
