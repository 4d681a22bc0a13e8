//! User directory: who is registered, with what privilege, and does a
//! presented secret check out.
//!
//! The hub only ever talks to the [`UserDirectory`] trait; the in-memory
//! implementation below serves tests and small deployments. A backing
//! store that keeps hashed secrets implements the same trait.

use std::collections::HashMap;

/// Privilege tier of a logged-in client.
///
/// Fixed for the lifetime of a roster record. Governs MOTD authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Unregistered,
    Registered,
    Superuser,
}

impl Privilege {
    /// The tag used in `LOGIN` replies and `CLIENTS` snapshots.
    pub fn tag(self) -> &'static str {
        match self {
            Privilege::Unregistered => "UNREGISTERED",
            Privilege::Registered => "REGISTERED",
            Privilege::Superuser => "SUPERUSER",
        }
    }
}

/// A directory hit: the user's privilege plus their secret verifier.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub privilege: Privilege,
    secret: String,
}

impl DirectoryEntry {
    pub fn new(privilege: Privilege, secret: impl Into<String>) -> Self {
        DirectoryEntry {
            privilege,
            secret: secret.into(),
        }
    }

    /// Does the presented secret match?
    pub fn verify(&self, secret: &str) -> bool {
        self.secret == secret
    }
}

/// Maps a name to its directory entry, if the user is known.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<DirectoryEntry>;
}

/// In-memory user directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: HashMap<String, DirectoryEntry>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, name: impl Into<String>, secret: impl Into<String>, privilege: Privilege) {
        self.users
            .insert(name.into(), DirectoryEntry::new(privilege, secret));
    }
}

impl UserDirectory for InMemoryDirectory {
    fn lookup(&self, name: &str) -> Option<DirectoryEntry> {
        self.users.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_unknown_user() {
        let db = InMemoryDirectory::new();
        assert!(db.lookup("ghost").is_none());
    }

    #[test]
    fn lookup_returns_privilege_and_verifies_secret() {
        let mut db = InMemoryDirectory::new();
        db.add_user("SirVer", "123456", Privilege::Superuser);

        let entry = db.lookup("SirVer").unwrap();
        assert_eq!(entry.privilege, Privilege::Superuser);
        assert!(entry.verify("123456"));
        assert!(!entry.verify("23456"));
    }

    #[test]
    fn privilege_tags() {
        assert_eq!(Privilege::Unregistered.tag(), "UNREGISTERED");
        assert_eq!(Privilege::Registered.tag(), "REGISTERED");
        assert_eq!(Privilege::Superuser.tag(), "SUPERUSER");
    }
}
