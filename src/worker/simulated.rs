//! In-process resource provider for tests and `--dry-run`.
//!
//! Resources are just ids in a set. A navigation signals `Loaded` after a
//! configurable latency, and individual queries can be made to fail.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use super::{ProviderError, ResourceEvent, ResourceProvider};
use crate::model::WorkerHandle;

const CHANNEL_CAPACITY: usize = 64;

pub struct SimulatedProvider {
    next_id: AtomicU64,
    live: Arc<Mutex<HashSet<WorkerHandle>>>,
    events: broadcast::Sender<ResourceEvent>,
    /// `None` means loads never signal completion.
    load_latency: Option<Duration>,
    refuse_create: AtomicBool,
    failing_queries: Mutex<HashSet<String>>,
    navigations: Mutex<Vec<String>>,
    created: AtomicU64,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// Loads complete after 50ms.
    pub fn new() -> Self {
        Self::with_load_latency(Some(Duration::from_millis(50)))
    }

    pub fn with_load_latency(load_latency: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashSet::new())),
            events,
            load_latency,
            refuse_create: AtomicBool::new(false),
            failing_queries: Mutex::new(HashSet::new()),
            navigations: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
        }
    }

    /// Make every subsequent `create` fail.
    pub fn refuse_create(&self, refuse: bool) {
        self.refuse_create.store(refuse, Ordering::SeqCst);
    }

    /// Navigations whose `q` parameter equals `query` fail.
    pub fn fail_query(&self, query: impl Into<String>) {
        lock(&self.failing_queries).insert(query.into());
    }

    /// Destroy a resource the way a user closing it would.
    pub fn destroy_externally(&self, handle: WorkerHandle) {
        if lock(&self.live).remove(&handle) {
            let _ = self.events.send(ResourceEvent::Destroyed(handle));
        }
    }

    /// Every locator navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }

    /// The `q` parameter of every navigation, in order.
    pub fn queries(&self) -> Vec<String> {
        self.navigations()
            .iter()
            .filter_map(|locator| query_of(locator))
            .collect()
    }

    /// Resources created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    async fn create(&self, _locator: &str) -> Result<WorkerHandle, ProviderError> {
        if self.refuse_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Refused("simulated refusal".to_string()));
        }
        let handle = WorkerHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.live).insert(handle);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn navigate(&self, handle: WorkerHandle, locator: &str) -> Result<(), ProviderError> {
        if !lock(&self.live).contains(&handle) {
            return Err(ProviderError::NotFound(handle));
        }
        lock(&self.navigations).push(locator.to_string());

        if let Some(query) = query_of(locator) {
            if lock(&self.failing_queries).contains(&query) {
                return Err(ProviderError::Navigation(format!("simulated failure for {query}")));
            }
        }

        if let Some(latency) = self.load_latency {
            let live = Arc::clone(&self.live);
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                if lock(&live).contains(&handle) {
                    let _ = events.send(ResourceEvent::Loaded(handle));
                }
            });
        }
        Ok(())
    }

    async fn destroy(&self, handle: WorkerHandle) -> Result<(), ProviderError> {
        if !lock(&self.live).remove(&handle) {
            return Err(ProviderError::NotFound(handle));
        }
        let _ = self.events.send(ResourceEvent::Destroyed(handle));
        Ok(())
    }

    async fn is_alive(&self, handle: WorkerHandle) -> bool {
        lock(&self.live).contains(&handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn query_of(locator: &str) -> Option<String> {
    let url = Url::parse(locator).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())
}
