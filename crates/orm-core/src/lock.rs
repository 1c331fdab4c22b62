//! Lock modes.

use serde::{Deserialize, Serialize};

/// The lock held (or requested) on an entity instance.
///
/// Modes are totally ordered by restrictiveness; a session only ever
/// upgrades the mode recorded on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LockMode {
    /// No lock; the instance may come from the cache.
    #[default]
    None,
    /// Read from the database in this transaction; the version was checked.
    Read,
    /// Verify the version at commit time.
    Optimistic,
    /// Increment the version at flush even when unmodified.
    OptimisticForceIncrement,
    /// Held implicitly by the session after an insert or update. Never requested explicitly.
    Write,
    /// `SELECT ... FOR UPDATE`
    Upgrade,
    /// `SELECT ... FOR UPDATE NOWAIT`
    UpgradeNoWait,
    /// Shared pessimistic lock.
    PessimisticRead,
    /// Exclusive pessimistic lock.
    PessimisticWrite,
    /// Exclusive lock plus an immediate version increment.
    Force,
    /// Pessimistic lock plus an immediate version increment.
    PessimisticForceIncrement,
}

impl LockMode {
    /// Relative restrictiveness of this mode.
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::Optimistic => 6,
            LockMode::OptimisticForceIncrement => 7,
            LockMode::Write | LockMode::Upgrade | LockMode::UpgradeNoWait => 10,
            LockMode::PessimisticRead => 12,
            LockMode::PessimisticWrite => 13,
            LockMode::Force => 15,
            LockMode::PessimisticForceIncrement => 17,
        }
    }

    /// Is this mode strictly more restrictive than `other`?
    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    /// Is this mode strictly less restrictive than `other`?
    pub const fn less_than(self, other: LockMode) -> bool {
        self.level() < other.level()
    }

    /// Does acquiring this mode bump the version instead of (or as well as) locking the row?
    pub const fn forces_version_increment(self) -> bool {
        matches!(
            self,
            LockMode::Force
                | LockMode::PessimisticForceIncrement
                | LockMode::OptimisticForceIncrement
        )
    }

    /// Is the version increment applied immediately rather than at flush?
    pub const fn increments_immediately(self) -> bool {
        matches!(self, LockMode::Force | LockMode::PessimisticForceIncrement)
    }

    /// Parse the conventional upper-case name of a mode.
    pub fn parse(name: &str) -> Option<Self> {
        let mode = match name.trim().to_ascii_uppercase().as_str() {
            "NONE" => LockMode::None,
            "READ" => LockMode::Read,
            "OPTIMISTIC" => LockMode::Optimistic,
            "OPTIMISTIC_FORCE_INCREMENT" => LockMode::OptimisticForceIncrement,
            "WRITE" => LockMode::Write,
            "UPGRADE" => LockMode::Upgrade,
            "UPGRADE_NOWAIT" => LockMode::UpgradeNoWait,
            "PESSIMISTIC_READ" => LockMode::PessimisticRead,
            "PESSIMISTIC_WRITE" => LockMode::PessimisticWrite,
            "FORCE" => LockMode::Force,
            "PESSIMISTIC_FORCE_INCREMENT" => LockMode::PessimisticForceIncrement,
            _ => return None,
        };
        Some(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(LockMode::Upgrade.greater_than(LockMode::Read));
        assert!(!LockMode::Upgrade.greater_than(LockMode::Write));
        assert!(LockMode::None.less_than(LockMode::Read));
        assert!(LockMode::PessimisticForceIncrement.greater_than(LockMode::Force));
    }

    #[test]
    fn test_force_modes() {
        assert!(LockMode::Force.forces_version_increment());
        assert!(LockMode::Force.increments_immediately());
        assert!(LockMode::OptimisticForceIncrement.forces_version_increment());
        assert!(!LockMode::OptimisticForceIncrement.increments_immediately());
        assert!(!LockMode::Upgrade.forces_version_increment());
    }

    #[test]
    fn test_parse() {
        assert_eq!(LockMode::parse("upgrade_nowait"), Some(LockMode::UpgradeNoWait));
        assert_eq!(LockMode::parse("bogus"), None);
    }
}
