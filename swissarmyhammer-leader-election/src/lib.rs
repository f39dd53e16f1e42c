//! File-lock based leader election over a shared directory.
//!
//! Independent processes that can only reach each other through a shared filesystem
//! path (commonly an NFS mount) elect one leader per namespace. Each namespace is a
//! lock file under a common root; whoever holds the OS advisory lock on it leads.
//!
//! # Overview
//!
//! - **File-lock based**: Uses OS-level file locking (`flock`) for mutual exclusion
//! - **Heartbeat record**: The leader rewrites a fixed 52-byte [`LeaderInfo`] record
//!   into the lock file so followers can tell a frozen leader from a live one
//! - **Bounded I/O**: Every filesystem touch runs with a hard timeout and a retry budget,
//!   so a hung mount never blocks the scheduler
//! - **Notifications**: Leadership changes are broadcast per namespace, in order
//!
//! # Example
//!
//! ```ignore
//! use swissarmyhammer_leader_election::{ClusterConfig, ClusterService, TimeUnit};
//!
//! let config = ClusterConfig::new()
//!     .with_root("/mnt/shared/leaders")
//!     .with_acquire_lock_interval(5, TimeUnit::Seconds);
//!
//! let service = ClusterService::new(config)?;
//! service.start()?;
//!
//! let mut events = service.subscribe("orders")?;
//! while let Ok(event) = events.recv().await {
//!     if event.is_leader() {
//!         // We lead "orders" - start the work only one process may do
//!     } else {
//!         // Leadership lost or not yet acquired - stop that work
//!     }
//! }
//! ```
//!
//! Leadership is decided by the lock alone. Heartbeat staleness is a diagnostic
//! available through [`ClusterView::observation`].

mod bounded;
pub mod codec;
mod config;
mod error;
mod event;
mod leader_info;
mod lock;
mod service;
pub mod staleness;
mod view;

pub use bounded::{BoundedTaskConfig, BoundedTaskExecutor};
pub use config::{ClusterConfig, TimeUnit, ENV_PREFIX};
pub use error::{AttemptFailure, ClusterError, Result};
pub use event::{ClusterMember, LeadershipEvent};
pub use leader_info::{now_millis, LeaderInfo, LEADER_ID_LEN};
pub use lock::{AdvisoryLocker, FileLocker, LockAttempt, LockFile, LockHandle};
pub use service::{validate_namespace, ClusterService};
pub use view::{ClusterView, LeaderObservation, ViewState};
