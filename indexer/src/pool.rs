//! Worker pool for the crawl indexer.
//!
//! A client pool runs `workers` tasks that pull jobs until the queue is empty,
//! plus a listener that stops the pool when the server broadcasts TERMINATE.
//! Being subscribed to the registration topic is what makes a client count as
//! connected.
//!
//! A server pool bootstraps the queue, recovers abandoned work, and then
//! supervises: whenever no client is connected but jobs sit in `active`, those
//! jobs go back to `idle` with their partial postings stripped. On shutdown it
//! keeps broadcasting TERMINATE until every client has disconnected.

use crate::indexing::Indexer;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use search_core::{CoordStore, Error, JobQueue, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const TERMINATE: &str = "TERMINATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Bootstrapping,
    Running,
    Terminating,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent worker tasks in client mode.
    pub workers: usize,
    /// Supervisor poll and TERMINATE re-broadcast period.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4, poll_interval: Duration::from_secs(1) }
    }
}

enum Role {
    Client { indexer: Indexer },
    Server { manifest: HashMap<String, String> },
}

pub struct WorkerPool {
    role: Role,
    config: PoolConfig,
    store: Arc<dyn CoordStore>,
    queue: JobQueue,
    running: AtomicBool,
    state: Mutex<PoolState>,
    live_workers: AtomicUsize,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<Subscription>>,
}

impl WorkerPool {
    pub fn client(store: Arc<dyn CoordStore>, indexer: Indexer, config: PoolConfig) -> Arc<Self> {
        Self::build(Role::Client { indexer }, store, config)
    }

    pub fn server(store: Arc<dyn CoordStore>, manifest: HashMap<String, String>, config: PoolConfig) -> Arc<Self> {
        Self::build(Role::Server { manifest }, store, config)
    }

    fn build(role: Role, store: Arc<dyn CoordStore>, config: PoolConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            role,
            config,
            queue: JobQueue::new(store.clone()),
            store,
            running: AtomicBool::new(false),
            state: Mutex::new(PoolState::Bootstrapping),
            live_workers: AtomicUsize::new(0),
            stop_tx,
            workers: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            supervisor: Mutex::new(None),
            registration: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> Mode {
        match self.role {
            Role::Client { .. } => Mode::Client,
            Role::Server { .. } => Mode::Server,
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: PoolState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(mode = ?self.mode(), from = ?*state, to = ?next, "pool state change");
            *state = next;
        }
    }

    /// Starts the pool. Fails if the queue cannot be prepared or the
    /// shutdown channel cannot be joined.
    pub async fn execute(self: &Arc<Self>) -> Result<()> {
        tracing::info!(mode = ?self.mode(), "executing worker pool");
        self.set_state(PoolState::Bootstrapping);
        match &self.role {
            Role::Client { indexer } => self.execute_client(indexer.clone()).await?,
            Role::Server { manifest } => self.execute_server(manifest).await?,
        }
        self.set_state(PoolState::Running);
        Ok(())
    }

    async fn execute_client(self: &Arc<Self>, indexer: Indexer) -> Result<()> {
        let keys = self.store.keys().clone();
        let registration = self.store.subscribe(&keys.client_registration()).await.context("registering client")?;
        let mut terminate = self.store.subscribe(&keys.terminate_broadcast()).await.context("subscribing to terminate broadcast")?;
        *self.registration.lock() = Some(registration);
        self.running.store(true, Ordering::SeqCst);

        let pool = Arc::clone(self);
        let listener = tokio::spawn(async move {
            while let Some(message) = terminate.next().await {
                if message == TERMINATE {
                    tracing::warn!("received TERMINATE from server");
                    pool.request_stop();
                    break;
                }
            }
        });
        *self.listener.lock() = Some(listener);

        let count = self.config.workers.max(1);
        self.live_workers.store(count, Ordering::SeqCst);
        let mut workers = self.workers.lock();
        for i in 0..count {
            let name = format!("worker-{}", i + 1);
            let handle = tokio::spawn(Arc::clone(self).work(name.clone(), indexer.clone()));
            workers.push((name, handle));
        }
        Ok(())
    }

    async fn work(self: Arc<Self>, name: String, indexer: Indexer) {
        while self.is_running() {
            let job = match self.queue.pull_next().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker = %name, error = %e, "cannot pull next job; backing off");
                    let mut stop = self.stop_tx.subscribe();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = stop.wait_for(|stopped| *stopped) => {}
                    }
                    continue;
                }
            };
            tracing::info!(worker = %name, path = %job.path, "got job");
            match indexer.run(&job).await {
                Ok(tokens) => match self.queue.complete(&job).await {
                    Ok(()) => tracing::info!(worker = %name, path = %job.path, tokens, "completed job"),
                    Err(e) => tracing::error!(worker = %name, path = %job.path, error = %e, "cannot mark job complete"),
                },
                Err(e) => {
                    tracing::error!(worker = %name, path = %job.path, error = %e, "indexing failed; job stays active for recovery")
                }
            }
        }
        if let Err(e) = indexer.safe_terminate().await {
            tracing::warn!(worker = %name, error = %e, "flush on worker exit failed");
        }
        tracing::info!(worker = %name, "worker finished");
        if self.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.stop_tx.send_replace(true);
        }
    }

    async fn execute_server(self: &Arc<Self>, manifest: &HashMap<String, String>) -> Result<()> {
        match self.queue.bootstrap(manifest).await {
            Ok(n) => tracing::info!(jobs = n, "bootstrapped idle queue from manifest"),
            Err(e @ Error::BootstrapConflict { .. }) => tracing::info!(reason = %e, "skipping bootstrap"),
            Err(e) => return Err(e).context("bootstrapping job queue"),
        }
        self.queue.recover_active().await.context("recovering active jobs")?;
        self.running.store(true, Ordering::SeqCst);

        let pool = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        let supervisor = tokio::spawn(async move {
            while pool.is_running() {
                if let Err(e) = pool.supervise_once().await {
                    tracing::error!(error = %e, "supervisor poll failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.poll_interval) => {}
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
        });
        *self.supervisor.lock() = Some(supervisor);
        Ok(())
    }

    /// One supervisor poll. Returns how many jobs were reclaimed.
    pub async fn supervise_once(&self) -> search_core::Result<usize> {
        let active = self.queue.active_len().await?;
        let idle = self.queue.idle_len().await?;
        let clients = self.store.subscriber_count(&self.store.keys().client_registration()).await?;
        tracing::info!(active, idle, clients, "queue status");
        if clients == 0 && active > 0 {
            tracing::warn!(active, "no clients connected; re-enqueuing active jobs to idle");
            return self.queue.recover_active().await;
        }
        Ok(0)
    }

    /// Stops new pulls; in-flight jobs still finish.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.set_state(PoolState::Terminating);
        self.stop_tx.send_replace(true);
    }

    /// Resolves once the pool has been asked to stop or, in client mode,
    /// every worker has run out of jobs.
    pub async fn finished(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Graceful shutdown. Clients join every worker before disconnecting;
    /// servers broadcast TERMINATE each poll interval until no client is left.
    pub async fn safe_terminate(&self) -> Result<()> {
        self.request_stop();
        match self.mode() {
            Mode::Client => self.terminate_client().await,
            Mode::Server => self.terminate_server().await?,
        }
        self.set_state(PoolState::Stopped);
        tracing::info!(mode = ?self.mode(), "terminating now");
        Ok(())
    }

    async fn terminate_client(&self) {
        let workers: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.workers.lock());
        let total = workers.len();
        for (i, (name, handle)) in workers.into_iter().enumerate() {
            let remaining = total - (i + 1);
            tracing::info!(worker = %name, remaining, "joining worker");
            if let Err(e) = handle.await {
                tracing::error!(worker = %name, error = %e, "worker task panicked");
            }
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.registration.lock().take();
    }

    async fn terminate_server(&self) -> Result<()> {
        let keys = self.store.keys().clone();
        loop {
            let clients = self.store.subscriber_count(&keys.client_registration()).await.context("counting clients")?;
            if clients == 0 {
                break;
            }
            self.store.publish(&keys.terminate_broadcast(), TERMINATE).await.context("broadcasting TERMINATE")?;
            tracing::info!(clients, "waiting for clients to disconnect");
            tokio::time::sleep(self.config.poll_interval).await;
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "supervisor task panicked");
            }
        }
        Ok(())
    }

    /// Runs until Ctrl-C or, for clients, until the queue is drained, then
    /// shuts down gracefully.
    pub async fn run_until_signal(self: &Arc<Self>) -> Result<()> {
        self.execute().await?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("listening for ctrl-c")?;
                tracing::warn!("interrupt received");
            }
            _ = self.finished() => {}
        }
        self.safe_terminate().await
    }
}
