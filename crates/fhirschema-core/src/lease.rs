//! Distributed lease on an (admin schema, target schema) pair.
//!
//! The lease is a row in the admin schema's `CONTROL` table carrying the
//! holder id and an expiry timestamp. A holder claims the row when it is
//! missing, expired, or already its own; a background heartbeat pushes the
//! expiry forward while work is in progress. A crashed holder stops renewing
//! and its lease becomes claimable once the expiry passes.
//!
//! ```text
//! Idle -> Acquiring -> Held <-> Renewing
//!                        |         |
//!                        v         v
//!                     Released   Expired
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::adapter::{transaction, DialectAdapter};
use crate::bookkeeping::{ClaimLease, InsertLease, LeaseRow, ReleaseLease, RenewLease, SelectLease};
use crate::error::{Error, Result};

/// Time source for lease timestamps and backoff sleeps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Wait for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when told to. `sleep` advances it instead of
/// blocking.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Lease timing.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a claim or renewal is valid.
    pub lease_time: Duration,
    /// First retry delay while waiting for a contended lease.
    pub poll_interval: Duration,
    /// Upper bound of the exponential backoff.
    pub max_backoff: Duration,
    /// The heartbeat renews every `lease_time / heartbeat_fraction`.
    pub heartbeat_fraction: u32,
    /// Whether to start the background heartbeat after acquiring.
    pub heartbeat: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_time: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            heartbeat_fraction: 3,
            heartbeat: true,
        }
    }
}

impl LeaseConfig {
    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Do not renew in the background; the lease lapses after `lease_time`.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = false;
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        self.lease_time / self.heartbeat_fraction.max(2)
    }

    fn lease_millis(&self) -> i64 {
        self.lease_time.as_millis() as i64
    }
}

/// Lifecycle of a [`LeaseManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    Acquiring,
    Held,
    Renewing,
    Released,
    Expired,
}

#[derive(Debug)]
struct Holding {
    state: LeaseState,
    expires_at: i64,
    /// Cleared by the heartbeat thread, under this lock, as it decides to exit.
    heartbeat_running: bool,
}

struct Shared {
    adapter: Arc<dyn DialectAdapter>,
    admin_schema: String,
    schema: String,
    holder_id: String,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    holding: Mutex<Holding>,
    stop: Mutex<bool>,
    stop_signal: Condvar,
}

impl Shared {
    fn is_held(&self) -> bool {
        let holding = self.holding.lock();
        matches!(holding.state, LeaseState::Held | LeaseState::Renewing)
            && self.clock.now_millis() < holding.expires_at
    }

    fn set_state(&self, state: LeaseState) {
        self.holding.lock().state = state;
    }

    fn try_acquire(&self) -> Result<bool> {
        let now = self.clock.now_millis();
        let until = now + self.config.lease_millis();
        let mut conn = self.adapter.connection()?;

        let claimed = transaction(&mut *conn, |c| {
            let updated = self.adapter.run_statement(
                c,
                &ClaimLease {
                    admin_schema: &self.admin_schema,
                    schema: &self.schema,
                    owner: &self.holder_id,
                    now,
                    lease_until: until,
                },
            )?;
            if updated == 0 {
                self.adapter.run_statement(
                    c,
                    &InsertLease {
                        admin_schema: &self.admin_schema,
                        schema: &self.schema,
                        owner: &self.holder_id,
                        now,
                        lease_until: until,
                    },
                )?;
            }
            Ok(())
        });

        match claimed {
            Ok(()) => {
                let mut holding = self.holding.lock();
                holding.state = LeaseState::Held;
                holding.expires_at = until;
                Ok(true)
            }
            Err(Error::UniqueViolation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn signal_heartbeat(&self) -> Result<bool> {
        {
            let mut holding = self.holding.lock();
            if holding.state != LeaseState::Held {
                return Ok(false);
            }
            holding.state = LeaseState::Renewing;
        }

        let now = self.clock.now_millis();
        let until = now + self.config.lease_millis();
        let renewed = self.adapter.connection().and_then(|mut conn| {
            transaction(&mut *conn, |c| {
                self.adapter.run_statement(
                    c,
                    &RenewLease {
                        admin_schema: &self.admin_schema,
                        schema: &self.schema,
                        owner: &self.holder_id,
                        now,
                        lease_until: until,
                    },
                )
            })
        });

        let mut holding = self.holding.lock();
        match renewed {
            Ok(rows) if rows > 0 => {
                holding.state = LeaseState::Held;
                holding.expires_at = until;
                tracing::trace!(schema = %self.schema, until, "lease renewed");
                Ok(true)
            }
            Ok(_) => {
                holding.state = LeaseState::Expired;
                tracing::warn!(
                    schema = %self.schema,
                    holder = %self.holder_id,
                    "lease lost: row expired or taken over by another holder"
                );
                Ok(false)
            }
            Err(e) => {
                holding.state = LeaseState::Held;
                Err(e)
            }
        }
    }

    fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval();
        loop {
            {
                let mut stop = self.stop.lock();
                if !*stop {
                    self.stop_signal.wait_for(&mut stop, interval);
                }
                if *stop {
                    self.holding.lock().heartbeat_running = false;
                    break;
                }
            }

            match self.signal_heartbeat() {
                Ok(true) => {}
                Ok(false) => {
                    // a concurrent renewal or re-acquire leaves the lease held
                    let mut holding = self.holding.lock();
                    if !matches!(holding.state, LeaseState::Held | LeaseState::Renewing) {
                        holding.heartbeat_running = false;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(schema = %self.schema, error = %e, "lease renewal failed, will retry");
                }
            }
        }
        tracing::debug!(schema = %self.schema, "lease heartbeat stopped");
    }
}

/// Holds and renews the lease for one target schema.
pub struct LeaseManager {
    shared: Arc<Shared>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    /// Lease manager using the system clock and a generated holder id.
    pub fn new(
        adapter: Arc<dyn DialectAdapter>,
        admin_schema: impl Into<String>,
        schema: impl Into<String>,
        config: LeaseConfig,
    ) -> Self {
        Self::build(adapter, admin_schema.into(), schema.into(), config, Arc::new(SystemClock), default_holder_id())
    }

    /// Replace the clock. Must be called before acquiring.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        let s = &self.shared;
        Self::build(
            s.adapter.clone(),
            s.admin_schema.clone(),
            s.schema.clone(),
            s.config.clone(),
            clock,
            s.holder_id.clone(),
        )
    }

    /// Replace the holder id. Must be called before acquiring.
    pub fn with_holder_id(self, holder_id: impl Into<String>) -> Self {
        let s = &self.shared;
        Self::build(
            s.adapter.clone(),
            s.admin_schema.clone(),
            s.schema.clone(),
            s.config.clone(),
            s.clock.clone(),
            holder_id.into(),
        )
    }

    fn build(
        adapter: Arc<dyn DialectAdapter>,
        admin_schema: String,
        schema: String,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
        holder_id: String,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                admin_schema,
                schema,
                holder_id,
                clock,
                config,
                holding: Mutex::new(Holding {
                    state: LeaseState::Idle,
                    expires_at: 0,
                    heartbeat_running: false,
                }),
                stop: Mutex::new(false),
                stop_signal: Condvar::new(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.shared.holder_id
    }

    pub fn schema(&self) -> &str {
        &self.shared.schema
    }

    pub fn state(&self) -> LeaseState {
        self.shared.holding.lock().state
    }

    /// Expiry of the held lease in epoch milliseconds.
    pub fn expires_at(&self) -> Option<i64> {
        let holding = self.shared.holding.lock();
        matches!(holding.state, LeaseState::Held | LeaseState::Renewing).then_some(holding.expires_at)
    }

    /// Try to take the lease, retrying with exponential backoff and jitter
    /// until `timeout` passes on the manager's clock. Re-acquiring a lease
    /// this manager still holds extends it without leaving `Held`.
    ///
    /// Returns `Ok(false)` on timeout. Transient errors are retried; any
    /// other error is returned immediately.
    pub fn wait_for_lease(&self, timeout: Duration) -> Result<bool> {
        let s = &self.shared;
        let was_held = s.is_held();
        if !was_held {
            s.set_state(LeaseState::Acquiring);
        }

        let deadline = s.clock.now_millis() + timeout.as_millis() as i64;
        let mut backoff = s.config.poll_interval.max(Duration::from_millis(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match s.try_acquire() {
                Ok(true) => {
                    tracing::info!(
                        schema = %s.schema,
                        holder = %s.holder_id,
                        attempts,
                        "lease acquired"
                    );
                    self.start_heartbeat();
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(schema = %s.schema, error = %e, "lease attempt failed, retrying");
                }
                Err(e) => {
                    if !was_held {
                        s.set_state(LeaseState::Idle);
                    }
                    return Err(e);
                }
            }

            let now = s.clock.now_millis();
            if now >= deadline {
                if !was_held {
                    s.set_state(LeaseState::Idle);
                }
                let holder = self.current_holder().ok().flatten().map(|r| r.owner);
                tracing::info!(
                    schema = %s.schema,
                    attempts,
                    holder = ?holder,
                    "timed out waiting for lease"
                );
                return Ok(false);
            }

            let backoff_ms = backoff.as_millis() as u64;
            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
            let remaining = (deadline - now) as u64;
            s.clock.sleep(Duration::from_millis((backoff_ms + jitter).min(remaining)));
            backoff = (backoff * 2).min(s.config.max_backoff);
        }
    }

    /// Extend the lease now. Returns `Ok(false)` when it is no longer ours.
    pub fn signal_heartbeat(&self) -> Result<bool> {
        self.shared.signal_heartbeat()
    }

    /// True while held and unexpired by the manager's clock.
    pub fn has_lease(&self) -> bool {
        self.shared.is_held()
    }

    /// Give the lease up. Returns `Ok(false)` if it was no longer held.
    pub fn cancel_lease(&self) -> Result<bool> {
        self.shutdown();
        let s = &self.shared;
        let state = self.state();
        if !matches!(state, LeaseState::Held | LeaseState::Renewing | LeaseState::Expired) {
            return Ok(false);
        }

        let was_valid = s.is_held();
        let mut conn = s.adapter.connection()?;
        let deleted = transaction(&mut *conn, |c| {
            s.adapter.run_statement(
                c,
                &ReleaseLease {
                    admin_schema: &s.admin_schema,
                    schema: &s.schema,
                    owner: &s.holder_id,
                },
            )
        })?;
        s.set_state(LeaseState::Released);

        let released = was_valid && deleted > 0;
        if released {
            tracing::info!(schema = %s.schema, holder = %s.holder_id, "lease released");
        } else {
            tracing::warn!(schema = %s.schema, holder = %s.holder_id, "lease was no longer held at release");
        }
        Ok(released)
    }

    /// Current row in the control table, whoever holds it.
    pub fn current_holder(&self) -> Result<Option<LeaseRow>> {
        let s = &self.shared;
        let mut conn = s.adapter.connection()?;
        s.adapter.run_statement(
            &mut *conn,
            &SelectLease {
                admin_schema: &s.admin_schema,
                schema: &s.schema,
            },
        )
    }

    /// Stop the heartbeat thread. Leaves the lease row alone.
    pub fn shutdown(&self) {
        *self.shared.stop.lock() = true;
        self.shared.stop_signal.notify_all();
        if let Some(handle) = self.heartbeat.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the heartbeat thread is running.
    pub fn is_heartbeat_running(&self) -> bool {
        self.shared.holding.lock().heartbeat_running
    }

    /// Start the heartbeat unless one is still renewing. A thread that has
    /// already given the lease up is joined and replaced.
    fn start_heartbeat(&self) {
        if !self.shared.config.heartbeat {
            return;
        }
        let mut slot = self.heartbeat.lock();
        {
            let mut holding = self.shared.holding.lock();
            if holding.heartbeat_running {
                return;
            }
            holding.heartbeat_running = true;
        }
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }
        *self.shared.stop.lock() = false;
        let shared = Arc::clone(&self.shared);
        *slot = Some(thread::spawn(move || shared.heartbeat_loop()));
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("admin_schema", &self.shared.admin_schema)
            .field("schema", &self.shared.schema)
            .field("holder_id", &self.shared.holder_id)
            .field("state", &self.state())
            .finish()
    }
}

/// `host:pid:random`.
fn default_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}:{:08x}", host, std::process::id(), rand::random::<u32>())
}
