//! HTTP resource provider.
//!
//! Each handle is a session on a shared `reqwest` client. Navigating issues
//! a GET in the background and broadcasts `Loaded` once the body has been
//! read; a failed request never signals, leaving the caller's timeout to
//! move things along.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{ProviderError, ResourceEvent, ResourceProvider};
use crate::error::{Error, Result};
use crate::model::WorkerHandle;

const CHANNEL_CAPACITY: usize = 64;

type Sessions = Arc<Mutex<HashMap<WorkerHandle, Option<AbortHandle>>>>;

pub struct HttpProvider {
    client: reqwest::Client,
    next_id: AtomicU64,
    /// Live sessions and their in-flight request, if any.
    sessions: Sessions,
    events: broadcast::Sender<ResourceEvent>,
}

impl HttpProvider {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("probe-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to build http client: {e}")))?;
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    fn load(&self, handle: WorkerHandle, locator: &str) {
        let client = self.client.clone();
        let events = self.events.clone();
        let sessions = Arc::clone(&self.sessions);
        let locator = locator.to_string();

        let task = tokio::spawn(async move {
            let loaded = match client.get(&locator).send().await {
                Ok(response) => response.bytes().await.is_ok(),
                Err(e) => {
                    debug!(%handle, error = %e, "request failed");
                    false
                }
            };
            if loaded && lock(&sessions).contains_key(&handle) {
                let _ = events.send(ResourceEvent::Loaded(handle));
            }
        });

        // A new navigation supersedes the previous one.
        if let Some(slot) = lock(&self.sessions).get_mut(&handle) {
            if let Some(previous) = slot.replace(task.abort_handle()) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }
}

#[async_trait]
impl ResourceProvider for HttpProvider {
    async fn create(&self, locator: &str) -> std::result::Result<WorkerHandle, ProviderError> {
        let handle = WorkerHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.sessions).insert(handle, None);
        if locator.starts_with("http://") || locator.starts_with("https://") {
            self.load(handle, locator);
        }
        Ok(handle)
    }

    async fn navigate(
        &self,
        handle: WorkerHandle,
        locator: &str,
    ) -> std::result::Result<(), ProviderError> {
        if !lock(&self.sessions).contains_key(&handle) {
            return Err(ProviderError::NotFound(handle));
        }
        reqwest::Url::parse(locator).map_err(|e| ProviderError::Navigation(e.to_string()))?;
        self.load(handle, locator);
        Ok(())
    }

    async fn destroy(&self, handle: WorkerHandle) -> std::result::Result<(), ProviderError> {
        let removed = lock(&self.sessions).remove(&handle);
        match removed {
            Some(in_flight) => {
                if let Some(request) = in_flight {
                    request.abort();
                }
                let _ = self.events.send(ResourceEvent::Destroyed(handle));
                Ok(())
            }
            None => Err(ProviderError::NotFound(handle)),
        }
    }

    async fn is_alive(&self, handle: WorkerHandle) -> bool {
        lock(&self.sessions).contains_key(&handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
