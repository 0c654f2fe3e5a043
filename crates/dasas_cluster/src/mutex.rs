//! Distributed mutual exclusion.
//!
//! Suzuki–Kasami token passing, one token per named resource. The token
//! carries the queue of outstanding requests and the per-device request and
//! service counters, so whoever holds it can forward it without asking
//! anyone. When released with an empty queue the token stays parked at its
//! last holder until someone asks for it.

use dasas_core::{CoreError, DeviceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;

/// Mutual exclusion errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutexError {
    /// The request was not granted within the grace period
    #[error("{resource} unavailable to {device}: request timed out")]
    ResourceUnavailable {
        /// Resource name
        resource: String,
        /// Requester
        device: DeviceId,
    },

    /// No token was ever minted for the resource
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// Release by a device that does not hold the token
    #[error("{device} does not hold {resource}")]
    NotHolder {
        /// Resource name
        resource: String,
        /// Would-be releaser
        device: DeviceId,
    },
}

impl From<MutexError> for CoreError {
    fn from(err: MutexError) -> Self {
        match err {
            MutexError::ResourceUnavailable { .. } => CoreError::Timeout {
                operation: err.to_string(),
            },
            MutexError::UnknownResource(name) => CoreError::not_found("resource", name),
            MutexError::NotHolder { .. } => CoreError::conflict(err.to_string()),
        }
    }
}

/// Result of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutexOutcome {
    /// The requester holds the token
    Granted,
    /// Waiting behind others; 1 is next in line
    Queued {
        /// Place in the queue
        position: usize,
    },
}

/// A pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Requesting device
    pub device: DeviceId,
    /// Logical timestamp of the request
    pub timestamp: u64,
}

impl QueuedRequest {
    fn key(&self) -> (u64, DeviceId) {
        (self.timestamp, self.device)
    }
}

/// Outcome of withdrawing a device from a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    /// Removed from the queue
    Dequeued,
    /// Was the holder; the token moved on
    Released(Option<DeviceId>),
    /// Not involved with this token
    Absent,
}

/// The token for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceToken {
    pub resource: String,
    /// Current holder, if granted
    pub holder: Option<DeviceId>,
    /// Last holder while the token is idle
    pub parked_at: Option<DeviceId>,
    /// Ordered by `(timestamp, device)`
    pub queue: Vec<QueuedRequest>,
    /// Requests issued per device
    pub requested: BTreeMap<DeviceId, u64>,
    /// Requests served per device
    pub served: BTreeMap<DeviceId, u64>,
}

impl ResourceToken {
    /// Mint the token, granted to its first requester
    #[must_use]
    pub fn mint(resource: impl Into<String>, device: DeviceId) -> Self {
        Self {
            resource: resource.into(),
            holder: Some(device),
            parked_at: None,
            queue: Vec::new(),
            requested: [(device, 1)].into_iter().collect(),
            served: BTreeMap::new(),
        }
    }

    /// Queue position of a device (1-based)
    #[must_use]
    pub fn position(&self, device: &DeviceId) -> Option<usize> {
        self.queue.iter().position(|r| &r.device == device).map(|i| i + 1)
    }

    /// Request the token
    pub fn request(&mut self, device: DeviceId, timestamp: u64) -> MutexOutcome {
        if self.holder == Some(device) {
            return MutexOutcome::Granted;
        }
        if let Some(position) = self.position(&device) {
            return MutexOutcome::Queued { position };
        }
        *self.requested.entry(device).or_insert(0) += 1;
        if self.holder.is_none() {
            self.holder = Some(device);
            self.parked_at = None;
            return MutexOutcome::Granted;
        }
        let request = QueuedRequest { device, timestamp };
        let at = self.queue.partition_point(|r| r.key() < request.key());
        self.queue.insert(at, request);
        MutexOutcome::Queued { position: at + 1 }
    }

    /// Release the token and forward it to the next outstanding request
    ///
    /// # Errors
    ///
    /// Returns `MutexError::NotHolder` if `device` does not hold the token
    pub fn release(&mut self, device: DeviceId) -> Result<Option<DeviceId>, MutexError> {
        if self.holder != Some(device) {
            return Err(MutexError::NotHolder {
                resource: self.resource.clone(),
                device,
            });
        }
        let issued = self.requested.get(&device).copied().unwrap_or(0);
        self.served.insert(device, issued);
        Ok(self.forward(device))
    }

    /// Remove a device from the token entirely
    pub fn withdraw(&mut self, device: DeviceId) -> Withdrawal {
        if self.holder == Some(device) {
            // release cannot fail for the holder
            let next = self.release(device).ok().flatten();
            return Withdrawal::Released(next);
        }
        if let Some(position) = self.position(&device) {
            self.queue.remove(position - 1);
            // an abandoned request counts as served
            let issued = self.requested.get(&device).copied().unwrap_or(0);
            self.served.insert(device, issued);
            return Withdrawal::Dequeued;
        }
        Withdrawal::Absent
    }

    fn outstanding(&self, device: &DeviceId) -> bool {
        let requested = self.requested.get(device).copied().unwrap_or(0);
        let served = self.served.get(device).copied().unwrap_or(0);
        requested == served + 1
    }

    fn forward(&mut self, from: DeviceId) -> Option<DeviceId> {
        while !self.queue.is_empty() {
            let next = self.queue.remove(0);
            if self.outstanding(&next.device) {
                self.holder = Some(next.device);
                self.parked_at = None;
                return Some(next.device);
            }
        }
        self.holder = None;
        self.parked_at = Some(from);
        None
    }

    /// Check structural invariants
    ///
    /// # Errors
    ///
    /// Returns a description of the first broken invariant
    pub fn check(&self) -> Result<(), String> {
        if let Some(holder) = self.holder
            && self.position(&holder).is_some()
        {
            return Err(format!("{holder} both holds and waits for {}", self.resource));
        }
        if self.holder.is_none() && !self.queue.is_empty() {
            return Err(format!("{} idle with {} waiting", self.resource, self.queue.len()));
        }
        if self.queue.windows(2).any(|w| w[0].key() >= w[1].key()) {
            return Err(format!("{} queue out of order", self.resource));
        }
        Ok(())
    }
}

/// All tokens of one cluster plus the callers blocked on them
#[derive(Debug, Default)]
pub struct MutexCoordinator {
    tokens: HashMap<String, ResourceToken>,
    waiters: HashMap<(String, DeviceId), oneshot::Sender<()>>,
    last_stamp: u64,
}

impl MutexCoordinator {
    /// Create an empty coordinator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a resource, minting its token on first use.
    ///
    /// `clock` is the requester's current vector clock weight; request
    /// stamps never go backwards within a cluster.
    pub fn request(&mut self, device: DeviceId, resource: &str, clock: u64) -> MutexOutcome {
        self.last_stamp = clock.max(self.last_stamp + 1);
        match self.tokens.get_mut(resource) {
            Some(token) => token.request(device, self.last_stamp),
            None => {
                self.tokens
                    .insert(resource.to_string(), ResourceToken::mint(resource, device));
                MutexOutcome::Granted
            }
        }
    }

    /// Register a caller waiting for `device` to be granted `resource`
    pub fn wait(&mut self, resource: &str, device: DeviceId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert((resource.to_string(), device), tx);
        rx
    }

    /// Release a resource; returns the device now holding it
    ///
    /// # Errors
    ///
    /// `UnknownResource` if never minted, `NotHolder` if `device` does not hold it
    pub fn release(&mut self, device: DeviceId, resource: &str) -> Result<Option<DeviceId>, MutexError> {
        let token = self.token_mut(resource)?;
        let next = token.release(device)?;
        Ok(self.hand_over(resource, next))
    }

    /// Drop a request whose caller gave up.
    ///
    /// A grant that raced the caller's timeout is revoked and passed on.
    ///
    /// # Errors
    ///
    /// `UnknownResource` if never minted
    pub fn cancel(&mut self, device: DeviceId, resource: &str) -> Result<Withdrawal, MutexError> {
        self.waiters.remove(&(resource.to_string(), device));
        let token = self.token_mut(resource)?;
        let withdrawal = token.withdraw(device);
        if let Withdrawal::Released(next) = withdrawal {
            let holder = self.hand_over(resource, next);
            return Ok(Withdrawal::Released(holder));
        }
        Ok(withdrawal)
    }

    /// Remove a departed or faulty device from every token; returns the
    /// resources whose holder changed and the new holder
    pub fn evict(&mut self, device: DeviceId) -> Vec<(String, Option<DeviceId>)> {
        self.waiters.retain(|(_, d), _| *d != device);
        let mut moved = Vec::new();
        let names: Vec<String> = self.tokens.keys().cloned().collect();
        for name in names {
            let Some(token) = self.tokens.get_mut(&name) else {
                continue;
            };
            if let Withdrawal::Released(next) = token.withdraw(device) {
                let holder = self.hand_over(&name, next);
                moved.push((name, holder));
            }
        }
        moved
    }

    /// Current holder
    ///
    /// # Errors
    ///
    /// `UnknownResource` if never minted
    pub fn holder(&self, resource: &str) -> Result<Option<DeviceId>, MutexError> {
        self.tokens
            .get(resource)
            .map(|t| t.holder)
            .ok_or_else(|| MutexError::UnknownResource(resource.to_string()))
    }

    /// Token state
    #[must_use]
    pub fn token(&self, resource: &str) -> Option<&ResourceToken> {
        self.tokens.get(resource)
    }

    /// Held resources and their holders
    #[must_use]
    pub fn held(&self) -> BTreeMap<String, DeviceId> {
        self.tokens
            .iter()
            .filter_map(|(name, t)| t.holder.map(|h| (name.clone(), h)))
            .collect()
    }

    /// Drop every token and waiter
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.waiters.clear();
    }

    /// Check every token
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvariantViolation` for the first broken token
    pub fn check(&self) -> Result<(), CoreError> {
        for token in self.tokens.values() {
            token.check().map_err(CoreError::invariant)?;
        }
        Ok(())
    }

    fn token_mut(&mut self, resource: &str) -> Result<&mut ResourceToken, MutexError> {
        self.tokens
            .get_mut(resource)
            .ok_or_else(|| MutexError::UnknownResource(resource.to_string()))
    }

    /// Notify the new holder's waiter. A waiter that already gave up means
    /// the grant is void, so the token keeps moving.
    fn hand_over(&mut self, resource: &str, mut next: Option<DeviceId>) -> Option<DeviceId> {
        while let Some(device) = next {
            let Some(waiter) = self.waiters.remove(&(resource.to_string(), device)) else {
                return Some(device);
            };
            if waiter.send(()).is_ok() {
                return Some(device);
            }
            tracing::debug!(resource, device = %device, "grant to abandoned request discarded");
            next = self
                .tokens
                .get_mut(resource)
                .and_then(|t| t.withdraw(device).into_next());
        }
        None
    }
}

impl Withdrawal {
    fn into_next(self) -> Option<DeviceId> {
        match self {
            Self::Released(next) => next,
            Self::Dequeued | Self::Absent => None,
        }
    }
}
