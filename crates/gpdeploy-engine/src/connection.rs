//! One authenticated channel per host.
//!
//! Every host has a slot guarded by its own lock. Acquiring, using and
//! replacing a host's channel all happen under that lock, so two workers can
//! never hold live channels to the same host at once. Channels are closed
//! exactly once: a channel id is tracked in `live` until it is closed.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use gpdeploy_runner::HostKeyMode;
use gpdeploy_utils::retry::retry_with;
use gpdeploy_utils::{CancelToken, DeployError, RetryPolicy};

use crate::credentials::CredentialContext;
use crate::transport::{Channel, Transport, TransportError};
use crate::trust::{HostKeyPolicy, TrustWarning};
use gpdeploy_runner::SshFailure;

/// Default channel idle window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Default)]
struct Slot {
    channel: Option<Channel>,
    /// A command timed out on this channel; verify before reuse.
    suspect: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialContext>,
    host_keys: Arc<dyn HostKeyPolicy>,
    cancel: CancelToken,
    user: String,
    idle: Duration,
    connect_retry: RetryPolicy,
    slots: Mutex<BTreeMap<String, Arc<Mutex<Slot>>>>,
    live: Mutex<BTreeMap<String, Channel>>,
    trusted: Mutex<HashSet<String>>,
    // Interactive logins share one terminal
    prompt_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialContext>,
        host_keys: Arc<dyn HostKeyPolicy>,
        cancel: CancelToken,
        user: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            credentials,
            host_keys,
            cancel,
            user: user.into(),
            idle: DEFAULT_IDLE_TIMEOUT,
            connect_retry: RetryPolicy::default(),
            slots: Mutex::new(BTreeMap::new()),
            live: Mutex::new(BTreeMap::new()),
            trusted: Mutex::new(HashSet::new()),
            prompt_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Retry bound for unreachable hosts. Authentication is never retried.
    #[must_use]
    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Scrub remote output with this run's credentials.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.credentials.redact(text)
    }

    /// Run-level error for a failed channel operation on `host`.
    pub fn transport_error(&self, err: TransportError, host: &str, command: &str) -> DeployError {
        err.into_deploy_with(host, &self.user, command, |text| self.redact(text))
    }

    fn slot(&self, host: &str) -> Arc<Mutex<Slot>> {
        Arc::clone(
            lock(&self.slots)
                .entry(host.to_string())
                .or_default(),
        )
    }

    /// The host's live channel, opening one if needed. Idempotent.
    pub fn acquire(&self, host: &str) -> Result<Channel, DeployError> {
        let slot = self.slot(host);
        let mut slot = lock(&slot);
        self.ensure_live(host, &mut slot)
    }

    /// Run `f` against the host's live channel with the host lock held.
    pub fn with_channel<T>(
        &self,
        host: &str,
        f: impl FnOnce(&dyn Transport, &Channel) -> T,
    ) -> Result<T, DeployError> {
        let slot = self.slot(host);
        let mut slot = lock(&slot);
        let channel = self.ensure_live(host, &mut slot)?;
        Ok(f(self.transport.as_ref(), &channel))
    }

    fn ensure_live(&self, host: &str, slot: &mut Slot) -> Result<Channel, DeployError> {
        if let Some(channel) = slot.channel.as_ref() {
            let expired = channel.is_expired(Instant::now());
            if !expired && !slot.suspect {
                return Ok(channel.clone());
            }
            if !expired && self.transport.check(channel) {
                tracing::debug!(host, "suspect channel still answers; keeping it");
                slot.suspect = false;
                return Ok(channel.clone());
            }
            tracing::debug!(host, expired, "replacing channel");
            if let Some(stale) = slot.channel.take() {
                self.close_channel(&stale);
            }
        }

        let mut channel = self.open(host)?;
        channel.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        channel.extend(self.idle);
        lock(&self.live).insert(host.to_string(), channel.clone());
        slot.channel = Some(channel.clone());
        slot.suspect = false;
        Ok(channel)
    }

    fn open(&self, host: &str) -> Result<Channel, DeployError> {
        retry_with(
            self.connect_retry,
            &self.cancel,
            DeployError::is_retryable,
            |attempt| {
                if attempt > 0 {
                    tracing::info!(host, attempt, "retrying connection");
                }
                self.open_once(host)
            },
        )
    }

    fn open_once(&self, host: &str) -> Result<Channel, DeployError> {
        let mode = if lock(&self.trusted).contains(host) {
            HostKeyMode::AcceptNew
        } else {
            HostKeyMode::Strict
        };

        match self.open_with(host, mode) {
            Err(TransportError::Ssh { failure, .. })
                if mode == HostKeyMode::Strict
                    && matches!(failure, SshFailure::HostKeyUnknown | SshFailure::HostKeyChanged) =>
            {
                let warning = TrustWarning {
                    host: host.to_string(),
                    changed: failure == SshFailure::HostKeyChanged,
                };
                let accepted = {
                    let _terminal = lock(&self.prompt_lock);
                    self.host_keys.acknowledge(&warning)
                };
                if !accepted {
                    return Err(DeployError::HostKeyRejected {
                        host: warning.host,
                        changed: warning.changed,
                    });
                }
                tracing::warn!(host, changed = warning.changed, "host key acknowledged for this run");
                lock(&self.trusted).insert(host.to_string());
                self.transport
                    .forget_host_key(host)
                    .map_err(|e| self.transport_error(e, host, "ssh-keygen -R"))?;
                self.open_with(host, HostKeyMode::AcceptNew)
                    .map_err(|e| self.transport_error(e, host, "ssh"))
            }
            other => other.map_err(|e| self.transport_error(e, host, "ssh")),
        }
    }

    fn open_with(&self, host: &str, mode: HostKeyMode) -> Result<Channel, TransportError> {
        let _terminal = self
            .credentials
            .needs_terminal()
            .then(|| lock(&self.prompt_lock));
        tracing::debug!(host, ?mode, "opening channel");
        self.credentials
            .with_master_auth(|auth| self.transport.open(host, auth, mode))
    }

    /// Extend the host's channel after a successful command.
    pub fn refresh(&self, host: &str) {
        let slot = self.slot(host);
        let mut slot = lock(&slot);
        if let Some(channel) = slot.channel.as_mut() {
            channel.extend(self.idle);
        }
    }

    /// Flag the channel for verification before its next use.
    pub fn mark_suspect(&self, host: &str) {
        let slot = self.slot(host);
        lock(&slot).suspect = true;
    }

    /// Close and forget the channel; the next use opens a new one.
    pub fn invalidate(&self, host: &str) {
        self.release(host);
    }

    /// Close the host's channel. No-op if none is open.
    pub fn release(&self, host: &str) {
        let slot = self.slot(host);
        let taken = lock(&slot).channel.take();
        if let Some(channel) = taken {
            self.close_channel(&channel);
        }
    }

    /// Close every channel. Channels whose host lock is held by an in-flight
    /// command are closed through the live table without waiting.
    pub fn release_all(&self) {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = lock(&self.slots)
            .iter()
            .map(|(host, slot)| (host.clone(), Arc::clone(slot)))
            .collect();

        for (host, slot) in slots {
            match slot.try_lock() {
                Ok(mut guard) => {
                    if let Some(channel) = guard.channel.take() {
                        self.close_channel(&channel);
                    }
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    if let Some(channel) = poisoned.into_inner().channel.take() {
                        self.close_channel(&channel);
                    }
                }
                Err(TryLockError::WouldBlock) => {
                    let live = lock(&self.live).get(&host).cloned();
                    if let Some(channel) = live {
                        tracing::debug!(host = %host, "closing busy channel");
                        self.close_channel(&channel);
                    }
                }
            }
        }
    }

    fn close_channel(&self, channel: &Channel) {
        let was_live = {
            let mut live = lock(&self.live);
            match live.get(&channel.host) {
                Some(current) if current.id == channel.id => {
                    live.remove(&channel.host);
                    true
                }
                _ => false,
            }
        };
        if was_live {
            tracing::debug!(host = %channel.host, "closing channel");
            self.transport.close(channel);
        }
    }

    /// Hosts with an open channel.
    #[must_use]
    pub fn live_hosts(&self) -> Vec<String> {
        lock(&self.live).keys().cloned().collect()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("user", &self.user)
            .field("idle", &self.idle)
            .field("live", &self.live_hosts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeReply, FakeTransport};
    use crate::trust::{AcceptAllHostKeys, RejectHostKeys};
    use gpdeploy_runner::AuthRejection;
    use gpdeploy_utils::Backoff;

    fn manager(transport: Arc<FakeTransport>, policy: Arc<dyn HostKeyPolicy>) -> ConnectionManager {
        ConnectionManager::new(
            transport,
            Arc::new(CredentialContext::empty()),
            policy,
            CancelToken::new(),
            "root",
        )
        .with_connect_retry(RetryPolicy::new(2, Backoff::None))
    }

    #[test]
    fn acquire_is_idempotent() {
        let fake = Arc::new(FakeTransport::new());
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        let first = cm.acquire("sdw1").unwrap();
        let second = cm.acquire("sdw1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(fake.opens("sdw1"), 1);
    }

    #[test]
    fn release_is_safe_when_nothing_is_open() {
        let fake = Arc::new(FakeTransport::new());
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        cm.release("never-acquired");
        cm.acquire("sdw1").unwrap();
        cm.release("sdw1");
        cm.release("sdw1");
        cm.release_all();
        assert_eq!(fake.closes("sdw1"), 1);
        assert_eq!(fake.live_count(), 0);
    }

    #[test]
    fn expired_channel_is_replaced() {
        let fake = Arc::new(FakeTransport::new());
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys)).with_idle_timeout(Duration::ZERO);
        let first = cm.acquire("sdw1").unwrap();
        let second = cm.acquire("sdw1").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(fake.closes("sdw1"), 1);
        assert_eq!(fake.max_live("sdw1"), 1);
    }

    #[test]
    fn unreachable_is_retried_then_fatal() {
        let fake = Arc::new(FakeTransport::new());
        fake.fail_open("sdw1", SshFailure::Unreachable);
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        let err = cm.acquire("sdw1").unwrap_err();
        assert!(matches!(err, DeployError::Connectivity { .. }));
        assert_eq!(fake.opens("sdw1"), 3);
    }

    #[test]
    fn authentication_is_never_retried() {
        let fake = Arc::new(FakeTransport::new());
        fake.fail_open("sdw1", SshFailure::AuthRejected(AuthRejection::PasswordRejected));
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        let err = cm.acquire("sdw1").unwrap_err();
        assert!(matches!(err, DeployError::Authentication { .. }));
        assert_eq!(fake.opens("sdw1"), 1);
    }

    #[test]
    fn unknown_host_key_needs_acknowledgement() {
        let fake = Arc::new(FakeTransport::new());
        fake.require_known_host_key("sdw1");
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        assert!(matches!(
            cm.acquire("sdw1"),
            Err(DeployError::HostKeyRejected { changed: false, .. })
        ));

        let cm = manager(Arc::clone(&fake), Arc::new(AcceptAllHostKeys));
        cm.acquire("sdw1").unwrap();
        assert!(fake.forgotten_keys().contains(&"sdw1".to_string()));
    }

    #[test]
    fn suspect_channel_is_checked_before_reuse() {
        let fake = Arc::new(FakeTransport::new());
        let cm = manager(Arc::clone(&fake), Arc::new(RejectHostKeys));
        let first = cm.acquire("sdw1").unwrap();
        cm.mark_suspect("sdw1");
        let kept = cm.acquire("sdw1").unwrap();
        assert_eq!(first.id, kept.id);

        cm.mark_suspect("sdw1");
        fake.set_check_result(false);
        let replaced = cm.acquire("sdw1").unwrap();
        assert_ne!(first.id, replaced.id);
        assert_eq!(fake.max_live("sdw1"), 1);
    }

    #[test]
    fn with_channel_serializes_per_host() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "sleep", FakeReply::ok("").after(Duration::from_millis(30)));
        let cm = Arc::new(manager(Arc::clone(&fake), Arc::new(RejectHostKeys)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cm = Arc::clone(&cm);
                std::thread::spawn(move || {
                    cm.with_channel("sdw1", |t, ch| t.exec(ch, "sleep", Duration::from_secs(5)))
                        .unwrap()
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fake.max_concurrent_exec("sdw1"), 1);
        assert_eq!(fake.opens("sdw1"), 1);
    }
}
