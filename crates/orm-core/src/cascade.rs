//! Per-association cascade configuration.

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// An operation that can be cascaded across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeKind {
    SaveUpdate,
    Persist,
    Merge,
    Delete,
    Lock,
    Refresh,
    Evict,
    Replicate,
}

impl CascadeKind {
    const fn bit(self) -> u16 {
        match self {
            CascadeKind::SaveUpdate => 1,
            CascadeKind::Persist => 1 << 1,
            CascadeKind::Merge => 1 << 2,
            CascadeKind::Delete => 1 << 3,
            CascadeKind::Lock => 1 << 4,
            CascadeKind::Refresh => 1 << 5,
            CascadeKind::Evict => 1 << 6,
            CascadeKind::Replicate => 1 << 7,
        }
    }
}

const DELETE_ORPHAN: u16 = 1 << 8;
const ALL: u16 = (1 << 8) - 1;

/// Which operations cascade across one association, plus orphan removal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CascadeStyle {
    bits: u16,
}

fn token_regex() -> Result<&'static Regex> {
    static TOKEN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    TOKEN
        .get_or_init(|| Regex::new(r"^[a-z]+(?:[-_][a-z]+)*$"))
        .as_ref()
        .map_err(|e| Error::Mapping(format!("invalid cascade token pattern: {e}")))
}

impl CascadeStyle {
    /// Nothing cascades.
    pub const NONE: CascadeStyle = CascadeStyle { bits: 0 };
    /// Every operation cascades; orphans are not deleted.
    pub const ALL: CascadeStyle = CascadeStyle { bits: ALL };
    /// Every operation cascades and orphans are deleted.
    pub const ALL_DELETE_ORPHAN: CascadeStyle = CascadeStyle {
        bits: ALL | DELETE_ORPHAN,
    };

    /// Style cascading exactly the given operations.
    pub fn of(kinds: &[CascadeKind]) -> Self {
        let bits = kinds.iter().fold(0, |acc, k| acc | k.bit());
        Self { bits }
    }

    /// Parse a comma separated list such as `"save-update, delete-orphan"`.
    pub fn parse(styles: &str) -> Result<Self> {
        let token_pattern = token_regex()?;
        let mut bits = 0u16;
        for raw in styles.split(',') {
            let token = raw.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            if !token_pattern.is_match(&token) {
                return Err(Error::Mapping(format!("malformed cascade style token '{raw}'")));
            }
            bits |= match token.replace('_', "-").as_str() {
                "none" => 0,
                "all" => ALL,
                "all-delete-orphan" => ALL | DELETE_ORPHAN,
                "delete-orphan" => DELETE_ORPHAN,
                "save-update" => CascadeKind::SaveUpdate.bit(),
                "persist" | "create" => CascadeKind::Persist.bit(),
                "merge" => CascadeKind::Merge.bit(),
                "delete" | "remove" => CascadeKind::Delete.bit(),
                "lock" => CascadeKind::Lock.bit(),
                "refresh" => CascadeKind::Refresh.bit(),
                "evict" | "detach" => CascadeKind::Evict.bit(),
                "replicate" => CascadeKind::Replicate.bit(),
                other => {
                    return Err(Error::Mapping(format!("unknown cascade style '{other}'")));
                }
            };
        }
        Ok(Self { bits })
    }

    /// Does `kind` cascade across this association?
    pub const fn does_cascade(self, kind: CascadeKind) -> bool {
        self.bits & kind.bit() != 0
    }

    /// Are elements removed from the association deleted?
    pub const fn has_orphan_delete(self) -> bool {
        self.bits & DELETE_ORPHAN != 0
    }

    /// Does anything cascade at all?
    pub const fn has_any(self) -> bool {
        self.bits != 0
    }

    /// Add orphan removal to this style.
    #[must_use]
    pub const fn with_orphan_delete(self) -> Self {
        Self {
            bits: self.bits | DELETE_ORPHAN,
        }
    }
}

impl fmt::Debug for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CascadeStyle({self})")
    }
}

impl fmt::Display for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bits == 0 {
            return write!(f, "none");
        }
        let names = [
            (CascadeKind::SaveUpdate, "save-update"),
            (CascadeKind::Persist, "persist"),
            (CascadeKind::Merge, "merge"),
            (CascadeKind::Delete, "delete"),
            (CascadeKind::Lock, "lock"),
            (CascadeKind::Refresh, "refresh"),
            (CascadeKind::Evict, "evict"),
            (CascadeKind::Replicate, "replicate"),
        ];
        let mut parts: Vec<&str> = if self.bits & ALL == ALL {
            vec!["all"]
        } else {
            names
                .iter()
                .filter(|(kind, _)| self.does_cascade(*kind))
                .map(|(_, name)| *name)
                .collect()
        };
        if self.has_orphan_delete() {
            parts.push("delete-orphan");
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_combined_styles() {
        let style = CascadeStyle::parse("save-update, delete-orphan").unwrap();
        assert!(style.does_cascade(CascadeKind::SaveUpdate));
        assert!(!style.does_cascade(CascadeKind::Delete));
        assert!(style.has_orphan_delete());
    }

    #[test]
    fn test_parse_all_delete_orphan() {
        let style = CascadeStyle::parse("all-delete-orphan").unwrap();
        assert_eq!(style, CascadeStyle::ALL_DELETE_ORPHAN);
        assert!(style.does_cascade(CascadeKind::Merge));
        assert!(style.does_cascade(CascadeKind::Lock));
    }

    #[test]
    fn test_parse_aliases_and_none() {
        let style = CascadeStyle::parse("persist,remove, detach").unwrap();
        assert!(style.does_cascade(CascadeKind::Persist));
        assert!(style.does_cascade(CascadeKind::Delete));
        assert!(style.does_cascade(CascadeKind::Evict));
        assert!(!CascadeStyle::parse("none").unwrap().has_any());
        assert!(!CascadeStyle::parse("").unwrap().has_any());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CascadeStyle::parse("save update").is_err());
        assert!(CascadeStyle::parse("explode").is_err());
        assert!(CascadeStyle::parse("delete;merge").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let style = CascadeStyle::of(&[CascadeKind::Merge, CascadeKind::Lock]).with_orphan_delete();
        assert_eq!(style.to_string(), "merge, lock, delete-orphan");
        assert_eq!(CascadeStyle::parse(&style.to_string()).unwrap(), style);
        assert_eq!(CascadeStyle::ALL.to_string(), "all");
    }
}
