use std::fmt;

/// Role of this replica in its replica set.
///
/// `Unknown` until the first role change after open; records replayed during
/// recovery are processed under `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaRole {
    #[default]
    Unknown,
    Primary,
    ActiveSecondary,
    IdleSecondary,
    None,
}

impl ReplicaRole {
    pub fn is_primary(self) -> bool {
        self == ReplicaRole::Primary
    }

    pub fn is_secondary(self) -> bool {
        matches!(self, ReplicaRole::ActiveSecondary | ReplicaRole::IdleSecondary)
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaRole::Unknown => "Unknown",
            ReplicaRole::Primary => "Primary",
            ReplicaRole::ActiveSecondary => "ActiveSecondary",
            ReplicaRole::IdleSecondary => "IdleSecondary",
            ReplicaRole::None => "None",
        };
        write!(f, "{}", name)
    }
}
