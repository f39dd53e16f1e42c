//! Per-process cluster service
//!
//! The service holds the configuration shared by every namespace, creates one
//! [`ClusterView`] per namespace on demand, and owns the two pools the views run on:
//! a single-threaded scheduler for the recurring lock attempts, and a small blocking
//! pool for bounded filesystem I/O. Both pools are built by [`ClusterService::start`]
//! and torn down by [`ClusterService::stop`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::bounded::BoundedTaskExecutor;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::event::{ClusterMember, LeadershipEvent};
use crate::lock::{AdvisoryLocker, FileLocker};
use crate::view::{ClusterView, SharedPools, ViewPools};

const SCHEDULER_THREAD_NAME: &str = "sah-cluster-scheduler";
const IO_THREAD_NAME: &str = "sah-cluster-io";

struct Runtimes {
    scheduler: Runtime,
    io: Runtime,
}

/// Leader election over lock files in a shared directory
pub struct ClusterService {
    config: Arc<ClusterConfig>,
    member_id: String,
    locker: Arc<dyn FileLocker>,
    pools: SharedPools,
    runtimes: Mutex<Option<Runtimes>>,
    views: Mutex<HashMap<String, ClusterView>>,
}

impl ClusterService {
    /// Create a stopped service, validating the configuration
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let member_id = config
            .member_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            config: Arc::new(config),
            member_id,
            locker: Arc::new(AdvisoryLocker),
            pools: Arc::new(RwLock::new(None)),
            runtimes: Mutex::new(None),
            views: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the lock strategy used by views created from now on
    pub fn with_locker(mut self, locker: Arc<dyn FileLocker>) -> Self {
        self.locker = locker;
        self
    }

    /// Identity of this process in every namespace
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// The validated configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Whether the pools are running
    pub fn is_started(&self) -> bool {
        self.runtimes().is_some()
    }

    /// Build the pools and start every known view
    ///
    /// A view that fails to start does not keep the others from starting; the
    /// first failure is returned.
    pub fn start(&self) -> Result<()> {
        {
            let mut runtimes = self.runtimes();
            if runtimes.is_none() {
                let built = self.build_runtimes()?;
                let pools = ViewPools {
                    scheduler: built.scheduler.handle().clone(),
                    executor: BoundedTaskExecutor::new(
                        built.io.handle().clone(),
                        self.config.bounded_task_config(),
                    )?,
                };
                *self
                    .pools
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pools);
                *runtimes = Some(built);

                info!(
                    "Started cluster service {} on {}",
                    self.member_id,
                    self.config.root.display()
                );
            }
        }

        let mut first_error = None;
        for view in self.views().values() {
            if let Err(e) = view.start() {
                error!(
                    "Failed to start view for namespace '{}': {}",
                    view.namespace(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every view and shut the pools down
    ///
    /// Safe to call when not started and to call repeatedly.
    pub fn stop(&self) {
        for view in self.views().values() {
            view.stop();
        }

        *self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;

        if let Some(runtimes) = self.runtimes().take() {
            // Abandoned I/O attempts may still be blocked in the kernel, do not wait for them
            runtimes.scheduler.shutdown_background();
            runtimes.io.shutdown_background();
            info!("Stopped cluster service {}", self.member_id);
        }
    }

    /// The view of `namespace`, created on first request
    ///
    /// A view created while the service runs is started right away.
    pub fn view(&self, namespace: &str) -> Result<ClusterView> {
        validate_namespace(namespace)?;

        let view = {
            let mut views = self.views();
            if let Some(view) = views.get(namespace) {
                return Ok(view.clone());
            }

            let view = ClusterView::new(
                namespace,
                self.config.root.join(namespace),
                &self.member_id,
                Arc::clone(&self.config),
                Arc::clone(&self.locker),
                Arc::clone(&self.pools),
            );
            views.insert(namespace.to_string(), view.clone());
            debug!("Created view for namespace '{}'", namespace);
            view
        };

        if self.is_started() {
            view.start()?;
        }
        Ok(view)
    }

    /// Subscribe to leadership changes of `namespace`, creating its view if needed
    pub fn subscribe(&self, namespace: &str) -> Result<broadcast::Receiver<LeadershipEvent>> {
        Ok(self.view(namespace)?.subscribe())
    }

    /// The local member if it leads `namespace`
    pub fn get_leader(&self, namespace: &str) -> Option<ClusterMember> {
        self.views().get(namespace).and_then(ClusterView::leader)
    }

    /// Whether this process leads `namespace`
    pub fn is_leader(&self, namespace: &str) -> bool {
        self.views()
            .get(namespace)
            .is_some_and(ClusterView::is_leader)
    }

    /// Namespaces with a view, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.views().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    fn build_runtimes(&self) -> Result<Runtimes> {
        let scheduler = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(SCHEDULER_THREAD_NAME)
            .enable_time()
            .build()
            .map_err(ClusterError::Runtime)?;

        let io = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.config.io_threads)
            .thread_name(IO_THREAD_NAME)
            .build()
            .map_err(ClusterError::Runtime)?;

        Ok(Runtimes { scheduler, io })
    }

    fn runtimes(&self) -> MutexGuard<'_, Option<Runtimes>> {
        self.runtimes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn views(&self) -> MutexGuard<'_, HashMap<String, ClusterView>> {
        self.views
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ClusterService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ClusterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("member_id", &self.member_id)
            .field("root", &self.config.root)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Check that `namespace` names a single file directly under the root
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let invalid = |message: &str| ClusterError::InvalidNamespace {
        namespace: namespace.to_string(),
        message: message.to_string(),
    };

    if namespace.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if namespace == "." || namespace == ".." {
        return Err(invalid("must not be a relative directory"));
    }
    if namespace.contains(['/', '\\', '\0']) {
        return Err(invalid("must not contain path separators or NUL"));
    }
    if Path::new(namespace).is_absolute() {
        return Err(invalid("must not be an absolute path"));
    }
    Ok(())
}
