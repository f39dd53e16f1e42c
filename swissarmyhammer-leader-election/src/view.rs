//! Per-namespace leadership state machine
//!
//! A view moves `Stopped -> Starting -> NoLock <-> Leading -> Stopped`. The two live
//! states only change inside a poll cycle, and poll cycles of one view are
//! serialized, so noticing a lost lock and taking a new one never race.
//!
//! Leadership is exactly "a lock handle is held and still valid". The heartbeat
//! record written into the lock file is bookkeeping for followers and never
//! decides who leads.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bounded::BoundedTaskExecutor;
use crate::codec;
use crate::config::ClusterConfig;
use crate::error::{AttemptFailure, ClusterError, Result};
use crate::event::{ClusterMember, LeadershipEvent};
use crate::leader_info::{now_millis, LeaderInfo};
use crate::lock::{FileLocker, LockAttempt, LockFile, LockHandle};
use crate::staleness;

/// Buffered notifications per view before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewState {
    /// Not polling, no file open
    Stopped,
    /// Opening the lock file
    Starting,
    /// Polling without holding the lock
    NoLock,
    /// Holding the lock
    Leading,
}

/// What a follower last saw in the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderObservation {
    /// Record read from the lock file, `None` when absent or partial
    pub leader: Option<LeaderInfo>,
    /// Whether the recorded leader looked dead compared to the previous observation
    pub stale: bool,
    /// When the record was read, milliseconds since the epoch
    pub observed_at_millis: i64,
}

/// Pools a view schedules its work on
#[derive(Debug, Clone)]
pub(crate) struct ViewPools {
    pub scheduler: tokio::runtime::Handle,
    pub executor: BoundedTaskExecutor,
}

/// Pools shared between a service and its views, `None` while the service is stopped
pub(crate) type SharedPools = Arc<RwLock<Option<ViewPools>>>;

/// Bookkeeping guarded by the view mutex, never held across an await
struct Slot {
    state: ViewState,
    lock_file: Option<LockFile>,
    lock: Option<LockHandle>,
    observation: Option<LeaderObservation>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    generation: u64,
}

struct ViewInner {
    namespace: String,
    lock_path: PathBuf,
    member: ClusterMember,
    config: Arc<ClusterConfig>,
    locker: Arc<dyn FileLocker>,
    pools: SharedPools,
    slot: Mutex<Slot>,
    transition: tokio::sync::Mutex<()>,
    events: broadcast::Sender<LeadershipEvent>,
}

/// Leadership view of one namespace
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct ClusterView {
    inner: Arc<ViewInner>,
}

impl ClusterView {
    pub(crate) fn new(
        namespace: impl Into<String>,
        lock_path: PathBuf,
        member_id: &str,
        config: Arc<ClusterConfig>,
        locker: Arc<dyn FileLocker>,
        pools: SharedPools,
    ) -> Self {
        let namespace = namespace.into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ViewInner {
                member: ClusterMember::local(member_id, namespace.clone()),
                namespace,
                lock_path,
                config,
                locker,
                pools,
                slot: Mutex::new(Slot {
                    state: ViewState::Stopped,
                    lock_file: None,
                    lock: None,
                    observation: None,
                    cancel: None,
                    tasks: Vec::new(),
                    generation: 0,
                }),
                transition: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Namespace this view elects a leader for
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Lock file of the namespace
    pub fn lock_path(&self) -> &Path {
        &self.inner.lock_path
    }

    /// Current lifecycle state
    pub fn state(&self) -> ViewState {
        self.inner.slot().state
    }

    /// Whether this process holds a valid lock for the namespace
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// The local member when it leads, otherwise `None`
    pub fn leader(&self) -> Option<ClusterMember> {
        self.is_leader().then(|| self.inner.member.clone())
    }

    /// The member representing this process
    pub fn local_member(&self) -> &ClusterMember {
        &self.inner.member
    }

    /// Other members of the namespace
    ///
    /// Always empty: followers never announce themselves in the lock file.
    pub fn members(&self) -> Vec<ClusterMember> {
        Vec::new()
    }

    /// The latest follower-side reading of the leader record
    pub fn observation(&self) -> Option<LeaderObservation> {
        self.inner.slot().observation.clone()
    }

    /// Subscribe to leadership changes of this namespace, in the order they happen
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.inner.events.subscribe()
    }

    /// Open the lock file and schedule lock attempts
    ///
    /// Every start announces "no leader" before the first attempt. Starting a
    /// running view does nothing.
    pub fn start(&self) -> Result<()> {
        let pools = self.inner.pools()?;

        let (cancel, generation) = {
            let mut slot = self.inner.slot();
            if slot.state != ViewState::Stopped {
                return Ok(());
            }
            slot.state = ViewState::Starting;

            let lock_file = match LockFile::open(&self.inner.lock_path) {
                Ok(lock_file) => lock_file,
                Err(e) => {
                    slot.state = ViewState::Stopped;
                    return Err(e);
                }
            };

            let cancel = CancellationToken::new();
            slot.lock_file = Some(lock_file);
            slot.cancel = Some(cancel.clone());
            slot.generation += 1;
            slot.state = ViewState::NoLock;
            (cancel, slot.generation)
        };

        debug!(
            "Started view for namespace '{}' on {}",
            self.inner.namespace,
            self.inner.lock_path.display()
        );
        self.inner
            .publish(LeadershipEvent::lost(self.inner.namespace.clone()));

        let mut tasks = vec![pools.scheduler.spawn(run_poll_loop(
            Arc::clone(&self.inner),
            pools.executor.clone(),
            cancel.clone(),
            generation,
        ))];
        if self.inner.config.write_heartbeat {
            tasks.push(pools.scheduler.spawn(run_heartbeat_loop(
                Arc::clone(&self.inner),
                pools.executor,
                cancel,
                generation,
            )));
        }

        let mut slot = self.inner.slot();
        if slot.generation == generation {
            slot.tasks = tasks;
        } else {
            // stopped while spawning
            tasks.iter().for_each(JoinHandle::abort);
        }
        Ok(())
    }

    /// Cancel scheduled work, release the lock and close the file
    ///
    /// Safe to call at any time, any number of times.
    pub fn stop(&self) {
        let (cancel, tasks, lock, lock_file) = {
            let mut slot = self.inner.slot();
            slot.state = ViewState::Stopped;
            slot.generation += 1;
            (
                slot.cancel.take(),
                std::mem::take(&mut slot.tasks),
                slot.lock.take(),
                slot.lock_file.take(),
            )
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        tasks.iter().for_each(JoinHandle::abort);

        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                debug!(
                    "Failed to release lock for namespace '{}': {}",
                    self.inner.namespace, e
                );
            }
            info!("Released leadership of namespace '{}'", self.inner.namespace);
        }

        if lock_file.is_some() {
            debug!("Stopped view for namespace '{}'", self.inner.namespace);
        }
    }

    /// Run one poll cycle right away, outside the schedule
    ///
    /// Does nothing on a stopped view.
    pub async fn poll_now(&self) -> Result<()> {
        let pools = self.inner.pools()?;
        let (cancel, generation) = {
            let slot = self.inner.slot();
            match &slot.cancel {
                Some(cancel) => (cancel.clone(), slot.generation),
                None => return Ok(()),
            }
        };
        self.inner.poll(&pools.executor, &cancel, generation).await
    }
}

impl std::fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterView")
            .field("namespace", &self.inner.namespace)
            .field("lock_path", &self.inner.lock_path)
            .field("state", &self.state())
            .finish()
    }
}

impl ViewInner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pools(&self) -> Result<ViewPools> {
        self.pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(ClusterError::ServiceNotStarted)
    }

    fn is_leader(&self) -> bool {
        self.slot()
            .lock
            .as_ref()
            .is_some_and(LockHandle::is_valid)
    }

    fn publish(&self, event: LeadershipEvent) {
        trace!("Publishing {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// One lock attempt cycle
    async fn poll(
        &self,
        executor: &BoundedTaskExecutor,
        cancel: &CancellationToken,
        generation: u64,
    ) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }

        let _transition = self.transition.lock().await;

        let (lock_file, lost) = {
            let mut slot = self.slot();
            if slot.generation != generation || slot.state == ViewState::Stopped {
                return Ok(());
            }
            if slot.lock.as_ref().is_some_and(LockHandle::is_valid) {
                // another cycle acquired while we waited
                return Ok(());
            }
            let lost = slot.lock.take();
            slot.state = ViewState::NoLock;
            (slot.lock_file.clone(), lost)
        };

        if let Some(lost) = lost {
            if let Err(e) = lost.release() {
                debug!("Failed to release lost lock: {}", e);
            }
            info!("Lost leadership of namespace '{}'", self.namespace);
            self.publish(LeadershipEvent::lost(self.namespace.clone()));
        }

        let Some(lock_file) = lock_file else {
            return Ok(());
        };

        let locker = Arc::clone(&self.locker);
        let target = lock_file.clone();
        let attempt = executor
            .run("try-lock", cancel, move || locker.try_lock(&target))
            .await
            .map_err(|e| match e {
                ClusterError::BoundedTask {
                    source: AttemptFailure::Failed(io),
                    ..
                } => ClusterError::LockAcquisition(io),
                other => other,
            })?;

        match attempt {
            None => Ok(()),
            Some(LockAttempt::Acquired(handle)) => {
                {
                    let mut slot = self.slot();
                    if slot.generation != generation || slot.state == ViewState::Stopped {
                        // stopped while the attempt ran, dropping the handle unlocks
                        return Ok(());
                    }
                    slot.lock = Some(handle);
                    slot.state = ViewState::Leading;
                    slot.observation = None;
                }

                info!("Acquired leadership of namespace '{}'", self.namespace);
                self.publish(LeadershipEvent::acquired(self.member.clone()));

                if self.config.write_heartbeat {
                    if let Err(e) = self.write_heartbeat(executor, cancel, &lock_file).await {
                        warn!(
                            "Failed to write leader record for namespace '{}': {}",
                            self.namespace, e
                        );
                    }
                }
                Ok(())
            }
            Some(LockAttempt::HeldElsewhere) => {
                debug!("Namespace '{}' is led by another process", self.namespace);
                self.observe_leader(executor, cancel).await;
                Ok(())
            }
            Some(LockAttempt::Overlapping) => {
                debug!(
                    "Lock for namespace '{}' is already held within this process",
                    self.namespace
                );
                self.observe_leader(executor, cancel).await;
                Ok(())
            }
        }
    }

    /// Write our own leader record into the lock file
    async fn write_heartbeat(
        &self,
        executor: &BoundedTaskExecutor,
        cancel: &CancellationToken,
        lock_file: &LockFile,
    ) -> Result<()> {
        let interval = i64::try_from(self.config.acquire_lock_interval().as_millis())
            .unwrap_or(i64::MAX);
        let info = LeaderInfo::new(self.member.id(), interval, now_millis())?;
        let force_metadata = self.config.force_metadata;
        let target = lock_file.clone();

        let written = executor
            .run("write-leader", cancel, move || {
                codec::write_leader_info_to_file(target.file(), &info, force_metadata)
            })
            .await?;
        if written.is_some() {
            trace!("Refreshed heartbeat of namespace '{}'", self.namespace);
        }
        Ok(())
    }

    /// Read the leader record and judge it against the previous reading
    async fn observe_leader(&self, executor: &BoundedTaskExecutor, cancel: &CancellationToken) {
        let path = self.lock_path.clone();
        let latest = match executor
            .run("read-leader", cancel, move || {
                codec::read_leader_info_from_path(&path)
            })
            .await
        {
            Ok(Some(latest)) => latest,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    "Failed to read leader record of namespace '{}': {}",
                    self.namespace, e
                );
                return;
            }
        };

        let now = now_millis();
        let mut slot = self.slot();
        let previous = slot
            .observation
            .as_ref()
            .and_then(|observation| observation.leader.clone());
        let stale = staleness::is_stale(
            latest.as_ref(),
            previous.as_ref(),
            now,
            self.config.heartbeat_timeout_multiplier,
        );

        match (&latest, stale) {
            (Some(leader), true) => warn!(
                "Leader {} of namespace '{}' has not refreshed its heartbeat",
                leader, self.namespace
            ),
            (None, _) => debug!("Namespace '{}' has no leader record", self.namespace),
            _ => {}
        }

        slot.observation = Some(LeaderObservation {
            leader: latest,
            stale,
            observed_at_millis: now,
        });
    }
}

/// Wait out the initial delay, then poll every interval until cancelled
async fn run_poll_loop(
    inner: Arc<ViewInner>,
    executor: BoundedTaskExecutor,
    cancel: CancellationToken,
    generation: u64,
) {
    let delay = inner.config.acquire_lock_delay();
    let period = inner.config.acquire_lock_interval();

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = inner.poll(&executor, &cancel, generation).await {
            error!(
                "Leadership poll for namespace '{}' failed: {}",
                inner.namespace, e
            );
        }
    }

    trace!("Poll loop for namespace '{}' exited", inner.namespace);
}

/// Rewrite the leader record every interval while leading
async fn run_heartbeat_loop(
    inner: Arc<ViewInner>,
    executor: BoundedTaskExecutor,
    cancel: CancellationToken,
    generation: u64,
) {
    let period = inner.config.acquire_lock_interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately, the record was written on acquisition
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let lock_file = {
            let slot = inner.slot();
            if slot.generation != generation {
                break;
            }
            let leading = slot.lock.as_ref().is_some_and(LockHandle::is_valid);
            match (&slot.lock_file, leading) {
                (Some(lock_file), true) => lock_file.clone(),
                _ => continue,
            }
        };

        if let Err(e) = inner.write_heartbeat(&executor, &cancel, &lock_file).await {
            warn!(
                "Failed to refresh heartbeat of namespace '{}': {}",
                inner.namespace, e
            );
        }
    }
}
