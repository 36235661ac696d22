//! Per-connection prepared statement registry.
//!
//! Maps caller-chosen names to SQL text and tracks whether the server holds a
//! prepared statement for the name. Statements are parsed lazily on their
//! first execution. Statements that must go away on the server (replaced,
//! deallocated or half-prepared after a failure) are retired and closed at the
//! start of the next extended-protocol cycle.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1).
pub(crate) const MAX_NAME_LEN: usize = 63;

/// Check that `name` is usable as a statement name.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if !valid_start || !valid_rest || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidUsage(format!(
            "invalid statement name {:?}: expected an identifier of at most {} bytes",
            name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Entry {
    sql: String,
    prepared: bool,
}

/// Registered statements of one connection.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
    retired: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name → sql`. A later registration of the same name wins;
    /// identical SQL keeps the server-side statement.
    pub fn register(&mut self, name: &str, sql: &str) {
        match self.entries.get_mut(name) {
            Some(entry) if entry.sql == sql => {}
            Some(entry) => {
                if entry.prepared {
                    self.retired.push(name.to_string());
                }
                entry.sql = sql.to_string();
                entry.prepared = false;
            }
            None => {
                self.entries.insert(
                    name.to_string(),
                    Entry {
                        sql: sql.to_string(),
                        prepared: false,
                    },
                );
            }
        }
    }

    /// SQL text and whether the server already holds the statement.
    pub fn lookup(&self, name: &str) -> Option<(&str, bool)> {
        self.entries
            .get(name)
            .map(|entry| (entry.sql.as_str(), entry.prepared))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn mark_prepared(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.prepared = true;
        }
    }

    /// The first execution failed; the server may or may not hold a
    /// statement under this name, so close it and parse again next time.
    pub fn mark_failed(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.prepared = false;
            if !self.retired.iter().any(|r| r == name) {
                self.retired.push(name.to_string());
            }
        }
    }

    /// Drop `name`. Returns false if it was not registered.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some(entry) => {
                if entry.prepared {
                    self.retired.push(name.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Names to close on the server before the next request.
    pub fn take_retired(&mut self) -> Vec<String> {
        std::mem::take(&mut self.retired)
    }

    /// Forget server-side state after the session was replaced.
    pub fn reset_server_state(&mut self) {
        self.retired.clear();
        for entry in self.entries.values_mut() {
            entry.prepared = false;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        let longest = "a".repeat(63);
        let too_long = "a".repeat(64);
        for ok in ["getUser", "_x", "s1$2", longest.as_str()] {
            assert!(validate_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "1abc", "get user", "drop;--", "é", too_long.as_str()] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn last_write_wins() {
        let mut registry = Registry::new();
        registry.register("q", "SELECT 1");
        registry.mark_prepared("q");

        registry.register("q", "SELECT 1");
        assert_eq!(registry.lookup("q"), Some(("SELECT 1", true)));
        assert!(registry.take_retired().is_empty());

        registry.register("q", "SELECT 2");
        assert_eq!(registry.lookup("q"), Some(("SELECT 2", false)));
        assert_eq!(registry.take_retired(), vec!["q".to_string()]);
        assert!(registry.take_retired().is_empty());
    }

    #[test]
    fn replacing_unprepared_statement_closes_nothing() {
        let mut registry = Registry::new();
        registry.register("q", "SELECT 1");
        registry.register("q", "SELECT 2");
        assert!(registry.take_retired().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failure_and_removal_retire() {
        let mut registry = Registry::new();
        registry.register("a", "SELECT $1");
        registry.mark_failed("a");
        registry.mark_failed("a");
        assert_eq!(registry.take_retired(), vec!["a".to_string()]);
        assert_eq!(registry.lookup("a"), Some(("SELECT $1", false)));

        registry.mark_prepared("a");
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.take_retired(), vec!["a".to_string()]);
        assert!(registry.lookup("a").is_none());
    }

    #[test]
    fn reset_forgets_server_state() {
        let mut registry = Registry::new();
        registry.register("a", "SELECT 1");
        registry.mark_prepared("a");
        registry.register("a", "SELECT 2");
        registry.mark_prepared("a");
        registry.reset_server_state();
        assert!(registry.take_retired().is_empty());
        assert_eq!(registry.lookup("a"), Some(("SELECT 2", false)));
    }
}
