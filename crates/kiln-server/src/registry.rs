//! Command descriptors and the registry that maps names to them.
//!
//! Each command carries its ACL categories, a sync flag (whether the
//! mutation must be ordered through the replicated log in cluster
//! mode), a key-extraction function the dispatcher uses for locking
//! and authorization, and the handler itself. Subcommands share the
//! same shape and override the parent's extraction and handler.

use std::future::Future;
use std::pin::Pin;

use ahash::AHashMap;
use bytes::Bytes;

use kiln_core::keyspace::OpContext;
use kiln_protocol::Frame;

use crate::connection::ConnHandle;
use crate::dispatch::ServerState;
use crate::error::CommandError;

/// ACL category tags. The per-type tags let an ACL config grant or
/// deny whole data types at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Read,
    Write,
    Fast,
    Slow,
    Pubsub,
    Admin,
    Connection,
    String,
    Generic,
    Hash,
    Set,
    SortedSet,
    List,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Read => "read",
            Category::Write => "write",
            Category::Fast => "fast",
            Category::Slow => "slow",
            Category::Pubsub => "pubsub",
            Category::Admin => "admin",
            Category::Connection => "connection",
            Category::String => "string",
            Category::Generic => "generic",
            Category::Hash => "hash",
            Category::Set => "set",
            Category::SortedSet => "sortedset",
            Category::List => "list",
        }
    }
}

/// The keys and channels one command invocation touches, split by
/// access mode. Produced by a command's key-extraction function before
/// authorization and locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessKeys {
    pub read_keys: Vec<String>,
    pub write_keys: Vec<String>,
    pub channels: Vec<String>,
}

impl AccessKeys {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read(keys: Vec<String>) -> Self {
        Self {
            read_keys: keys,
            ..Self::default()
        }
    }

    pub fn write(keys: Vec<String>) -> Self {
        Self {
            write_keys: keys,
            ..Self::default()
        }
    }

    pub fn channels(channels: Vec<String>) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }

    /// Total number of distinct keys (read + write).
    pub fn key_count(&self) -> usize {
        self.read_keys.len() + self.write_keys.len()
    }
}

/// Everything a handler gets: the request context, the raw command
/// tokens, the shared server state, and the connection (absent for
/// raft-apply and AOF-replay dispatches).
pub struct HandlerInput<'a> {
    pub ctx: &'a OpContext,
    pub tokens: &'a [Bytes],
    pub server: &'a std::sync::Arc<ServerState>,
    pub conn: Option<&'a ConnHandle>,
}

pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Frame, CommandError>> + Send + 'a>>;

/// A command handler. Handlers lock their own keys (in ascending key
/// order), operate through the keyspace capability, and return a typed
/// reply; guards release on every exit path by construction.
pub type HandlerFn = for<'a> fn(HandlerInput<'a>) -> HandlerFuture<'a>;

/// Key extraction: from raw tokens to the touched keys/channels, or a
/// client-facing error (typically wrong arity).
pub type KeyExtractor = fn(&[Bytes]) -> Result<AccessKeys, CommandError>;

/// A subcommand descriptor.
pub struct SubCommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub categories: &'static [Category],
    pub sync: bool,
    pub key_extraction: KeyExtractor,
    pub handler: HandlerFn,
}

/// A top-level command descriptor.
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub categories: &'static [Category],
    pub sync: bool,
    pub key_extraction: KeyExtractor,
    pub handler: HandlerFn,
    pub subcommands: Vec<SubCommandSpec>,
}

/// The dispatch-relevant view of a command after subcommand resolution.
#[derive(Clone, Copy)]
pub struct Resolved<'a> {
    pub name: &'a str,
    pub categories: &'static [Category],
    pub sync: bool,
    pub key_extraction: KeyExtractor,
    pub handler: HandlerFn,
}

impl CommandSpec {
    /// Resolves the effective descriptor: when the second token names
    /// one of this command's subcommands (case-insensitively), the
    /// subcommand's extraction and handler take over.
    pub fn resolve(&self, tokens: &[Bytes]) -> Resolved<'_> {
        if !self.subcommands.is_empty() {
            if let Some(sub_token) = tokens.get(1) {
                if let Ok(sub_name) = std::str::from_utf8(sub_token) {
                    for sub in &self.subcommands {
                        if sub.name.eq_ignore_ascii_case(sub_name) {
                            return Resolved {
                                name: sub.name,
                                categories: sub.categories,
                                sync: sub.sync,
                                key_extraction: sub.key_extraction,
                                handler: sub.handler,
                            };
                        }
                    }
                }
            }
        }
        Resolved {
            name: self.name,
            categories: self.categories,
            sync: self.sync,
            key_extraction: self.key_extraction,
            handler: self.handler,
        }
    }

    /// Whether this descriptor carries the write category.
    pub fn is_write(&self) -> bool {
        self.categories.contains(&Category::Write)
    }
}

impl Resolved<'_> {
    pub fn is_write(&self) -> bool {
        self.categories.contains(&Category::Write)
    }

    pub fn category_names(&self) -> Vec<&'static str> {
        self.categories.iter().map(|c| c.as_str()).collect()
    }
}

/// The command registry: name → descriptor.
pub struct Registry {
    commands: AHashMap<&'static str, CommandSpec>,
}

impl Registry {
    /// Builds the full standard command set.
    pub fn standard() -> Self {
        let mut commands = AHashMap::new();
        for spec in crate::commands::all_specs() {
            commands.insert(spec.name, spec);
        }
        Self { commands }
    }

    /// Looks up a command by its (already upper-cased) name.
    pub fn get(&self, name_upper: &str) -> Option<&CommandSpec> {
        self.commands.get(name_upper)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_core_commands() {
        let registry = Registry::standard();
        for name in [
            "GET", "SET", "DEL", "EXPIRE", "HSET", "SADD", "ZADD", "LPUSH", "SUBSCRIBE",
            "PUBLISH", "PING", "AUTH", "COMMAND", "SAVE", "BGSAVE", "BGREWRITEAOF",
        ] {
            assert!(registry.get(name).is_some(), "missing command {name}");
        }
    }

    #[test]
    fn write_commands_are_marked_sync() {
        let registry = Registry::standard();
        for name in ["SET", "DEL", "HSET", "SADD", "ZADD", "LPUSH", "EXPIRE"] {
            let spec = registry.get(name).unwrap();
            assert!(spec.is_write(), "{name} should be a write command");
            assert!(spec.sync, "{name} should be synced through the log");
        }
        for name in ["GET", "TTL", "HGET", "SMEMBERS", "ZSCORE", "LRANGE"] {
            let spec = registry.get(name).unwrap();
            assert!(!spec.is_write(), "{name} should not be a write command");
            assert!(!spec.sync, "{name} should not be synced");
        }
    }

    #[test]
    fn subcommand_resolution_is_case_insensitive() {
        let registry = Registry::standard();
        let spec = registry.get("COMMAND").unwrap();

        let tokens = vec![Bytes::from_static(b"COMMAND"), Bytes::from_static(b"count")];
        let resolved = spec.resolve(&tokens);
        assert_eq!(resolved.name, "COUNT");

        let tokens = vec![Bytes::from_static(b"COMMAND"), Bytes::from_static(b"LIST")];
        let resolved = spec.resolve(&tokens);
        assert_eq!(resolved.name, "LIST");

        // unknown subcommand falls back to the parent handler
        let tokens = vec![Bytes::from_static(b"COMMAND")];
        let resolved = spec.resolve(&tokens);
        assert_eq!(resolved.name, "COMMAND");
    }

    #[test]
    fn access_keys_builders() {
        let keys = AccessKeys::read(vec!["a".into(), "b".into()]);
        assert_eq!(keys.key_count(), 2);
        assert!(keys.write_keys.is_empty());

        let keys = AccessKeys::write(vec!["a".into()]);
        assert_eq!(keys.key_count(), 1);

        let keys = AccessKeys::channels(vec!["ch".into()]);
        assert_eq!(keys.key_count(), 0);
        assert_eq!(keys.channels.len(), 1);
    }
}
