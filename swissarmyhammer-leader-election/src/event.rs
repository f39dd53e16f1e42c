//! Members and leadership-changed notifications

use std::fmt;

use serde::Serialize;

/// A member of a namespace's cluster
///
/// The lock-file protocol cannot enumerate followers, so the only member a
/// view can address is the local process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClusterMember {
    id: String,
    namespace: String,
}

impl ClusterMember {
    pub(crate) fn local(id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
        }
    }

    /// Member identity, the id written into leader records
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace this member belongs to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether this member is the current process (always true)
    pub fn is_local(&self) -> bool {
        true
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.namespace)
    }
}

/// Leadership of a namespace changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadershipEvent {
    /// Namespace whose leadership changed
    pub namespace: String,
    /// The local member when it became leader, `None` when there is no local leader
    pub leader: Option<ClusterMember>,
}

impl LeadershipEvent {
    pub(crate) fn acquired(member: ClusterMember) -> Self {
        Self {
            namespace: member.namespace().to_string(),
            leader: Some(member),
        }
    }

    pub(crate) fn lost(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            leader: None,
        }
    }

    /// Whether the event announces the local member as leader
    pub fn is_leader(&self) -> bool {
        self.leader.is_some()
    }
}
