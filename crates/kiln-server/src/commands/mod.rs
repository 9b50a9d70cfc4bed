//! Command handlers, grouped by data type.
//!
//! Every module contributes descriptors to the registry via
//! [`all_specs`]. Handlers validate arguments before taking any locks,
//! acquire multi-key locks in ascending key order, operate through the
//! keyspace capability guards, and return typed replies.

pub mod admin;
pub mod generic;
pub mod hash;
pub mod list;
pub mod pubsub;
pub mod set;
pub mod string;
pub mod zset;

use std::collections::BTreeMap;

use ahash::AHashMap;
use bytes::Bytes;

use kiln_core::keyspace::{Keyspace, OpContext, ReadGuard, WriteGuard};
use kiln_core::types::{Scalar, SortedSet, Value};
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::CommandSpec;

/// Wraps an `async fn(HandlerInput) -> Result<Frame, CommandError>`
/// into the boxed-future fn pointer the registry stores.
macro_rules! handler {
    ($f:path) => {{
        fn wrap(
            input: $crate::registry::HandlerInput<'_>,
        ) -> $crate::registry::HandlerFuture<'_> {
            Box::pin($f(input))
        }
        wrap as $crate::registry::HandlerFn
    }};
}
pub(crate) use handler;

/// Collects every command descriptor for the registry.
pub fn all_specs() -> Vec<CommandSpec> {
    let mut specs = Vec::new();
    specs.extend(string::specs());
    specs.extend(generic::specs());
    specs.extend(hash::specs());
    specs.extend(set::specs());
    specs.extend(zset::specs());
    specs.extend(list::specs());
    specs.extend(pubsub::specs());
    specs.extend(admin::specs());
    specs
}

// ---------------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------------

/// Fails with wrong-arity unless `min <= tokens.len()` and, when `max`
/// is set, `tokens.len() <= max`.
pub(crate) fn check_arity(
    tokens: &[Bytes],
    min: usize,
    max: Option<usize>,
    name: &'static str,
) -> Result<(), CommandError> {
    if tokens.len() < min || max.map(|m| tokens.len() > m).unwrap_or(false) {
        return Err(CommandError::WrongArity(name));
    }
    Ok(())
}

/// A token as UTF-8, or a protocol error.
pub(crate) fn token_str(token: &Bytes) -> Result<&str, CommandError> {
    std::str::from_utf8(token)
        .map_err(|_| CommandError::Protocol("argument is not valid utf-8".into()))
}

/// The key at token position `idx`.
pub(crate) fn key_at(tokens: &[Bytes], idx: usize) -> Result<String, CommandError> {
    tokens
        .get(idx)
        .ok_or(CommandError::Protocol("missing key argument".into()))
        .and_then(|t| token_str(t).map(str::to_owned))
}

/// All keys from token position `start` onward.
pub(crate) fn keys_from(tokens: &[Bytes], start: usize) -> Result<Vec<String>, CommandError> {
    tokens[start..]
        .iter()
        .map(|t| token_str(t).map(str::to_owned))
        .collect()
}

/// Parses a base-10 i64 with the conventional client-facing error.
pub(crate) fn parse_int(token: &Bytes) -> Result<i64, CommandError> {
    token_str(token)?
        .parse()
        .map_err(|_| CommandError::value("value is not an integer or out of range"))
}

/// Parses a non-negative count argument.
pub(crate) fn parse_count(token: &Bytes) -> Result<usize, CommandError> {
    let n = parse_int(token)?;
    usize::try_from(n).map_err(|_| CommandError::value("value is out of range, must be positive"))
}

/// Parses a double, accepting `inf`/`+inf`/`-inf`.
pub(crate) fn parse_float(token: &Bytes) -> Result<f64, CommandError> {
    let s = token_str(token)?;
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => return Ok(f64::INFINITY),
        "-inf" | "-infinity" => return Ok(f64::NEG_INFINITY),
        _ => {}
    }
    s.parse()
        .map_err(|_| CommandError::value("value is not a valid float"))
}

// ---------------------------------------------------------------------------
// reply helpers
// ---------------------------------------------------------------------------

pub(crate) fn ok() -> Frame {
    Frame::Simple("OK".into())
}

pub(crate) fn int(n: i64) -> Frame {
    Frame::Integer(n)
}

pub(crate) fn bulk_str(s: impl Into<String>) -> Frame {
    Frame::Bulk(Bytes::from(s.into()))
}

pub(crate) fn float_reply(f: f64) -> Frame {
    Frame::Bulk(Bytes::from(kiln_core::types::format_float(f)))
}

// ---------------------------------------------------------------------------
// value access helpers
// ---------------------------------------------------------------------------

/// The string representation of a scalar value, or wrong-type.
pub(crate) fn scalar_repr(value: &Value) -> Result<Bytes, CommandError> {
    value.as_string_repr().ok_or(CommandError::WrongType)
}

pub(crate) fn as_hash(value: &Value) -> Result<&AHashMap<String, Scalar>, CommandError> {
    match value {
        Value::Hash(map) => Ok(map),
        _ => Err(CommandError::WrongType),
    }
}

pub(crate) fn as_set(value: &Value) -> Result<&ahash::AHashSet<String>, CommandError> {
    match value {
        Value::Set(set) => Ok(set),
        _ => Err(CommandError::WrongType),
    }
}

pub(crate) fn as_zset(value: &Value) -> Result<&SortedSet, CommandError> {
    match value {
        Value::SortedSet(zset) => Ok(zset),
        _ => Err(CommandError::WrongType),
    }
}

pub(crate) fn as_list(value: &Value) -> Result<&std::collections::VecDeque<Bytes>, CommandError> {
    match value {
        Value::List(list) => Ok(list),
        _ => Err(CommandError::WrongType),
    }
}

/// Initializes a freshly-created key with an empty container, then
/// returns the container mutably; an existing key must already hold
/// the right type.
macro_rules! container_mut {
    ($fn_name:ident, $variant:ident, $ty:ty, $empty:expr) => {
        pub(crate) fn $fn_name<'a>(
            guard: &'a mut WriteGuard,
            created: bool,
        ) -> Result<&'a mut $ty, CommandError> {
            if created {
                guard.set(Value::$variant($empty));
            }
            match guard.value_mut() {
                Value::$variant(inner) => Ok(inner),
                _ => Err(CommandError::WrongType),
            }
        }
    };
}

container_mut!(hash_mut, Hash, AHashMap<String, Scalar>, AHashMap::new());
container_mut!(set_mut, Set, ahash::AHashSet<String>, ahash::AHashSet::new());
container_mut!(zset_mut, SortedSet, SortedSet, SortedSet::new());
container_mut!(
    list_mut,
    List,
    std::collections::VecDeque<Bytes>,
    std::collections::VecDeque::new()
);

/// Deletes the key when its container emptied out, otherwise just
/// releases the guard. Containers never persist empty.
pub(crate) fn drop_if_empty(keyspace: &Keyspace, guard: WriteGuard) {
    let empty = match guard.value() {
        Value::Hash(map) => map.is_empty(),
        Value::Set(set) => set.is_empty(),
        Value::SortedSet(zset) => zset.is_empty(),
        Value::List(list) => list.is_empty(),
        _ => false,
    };
    if empty {
        keyspace.delete(guard);
    }
}

// ---------------------------------------------------------------------------
// multi-key locking
// ---------------------------------------------------------------------------

/// How a multi-key command needs each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Intent {
    /// Read lock; a missing key is reported as `Missing`.
    Read,
    /// Write lock; a missing key is reported as `Missing`.
    Write,
    /// `create_and_lock`: the key is created when absent.
    Create,
}

/// A held (or absent) per-key lock from a multi-key acquisition.
pub(crate) enum KeyGuard {
    Read(ReadGuard),
    Write {
        guard: WriteGuard,
        /// The key was created by this acquisition (its value is still
        /// the empty placeholder).
        created: bool,
    },
    /// The key didn't exist (and the intent didn't create it).
    Missing,
}

impl KeyGuard {
    /// The stored value, for keys that existed before this command.
    /// Freshly-created keys read as absent — their placeholder value
    /// is not observable.
    pub(crate) fn value(&self) -> Option<&Value> {
        match self {
            KeyGuard::Read(g) => Some(g.value()),
            KeyGuard::Write { guard, created } => {
                if *created {
                    None
                } else {
                    Some(guard.value())
                }
            }
            KeyGuard::Missing => None,
        }
    }

    pub(crate) fn into_write(self) -> Option<WriteGuard> {
        match self {
            KeyGuard::Write { guard, .. } => Some(guard),
            _ => None,
        }
    }

    pub(crate) fn into_write_with_created(self) -> Option<(WriteGuard, bool)> {
        match self {
            KeyGuard::Write { guard, created } => Some((guard, created)),
            _ => None,
        }
    }
}

/// Acquires locks for a multi-key command in lexicographically
/// ascending key order, the global deadlock-avoidance rule. Duplicate
/// keys collapse to the strongest intent. On any failure, guards
/// acquired so far release on drop.
pub(crate) async fn lock_keys(
    keyspace: &Keyspace,
    wants: Vec<(String, Intent)>,
    ctx: &OpContext,
) -> Result<AHashMap<String, KeyGuard>, CommandError> {
    let mut plan: BTreeMap<String, Intent> = BTreeMap::new();
    for (key, intent) in wants {
        plan.entry(key)
            .and_modify(|existing| {
                if intent > *existing {
                    *existing = intent;
                }
            })
            .or_insert(intent);
    }

    let mut guards = AHashMap::with_capacity(plan.len());
    for (key, intent) in plan {
        let guard = match intent {
            Intent::Read => match keyspace.rlock(&key, ctx).await {
                Ok(g) => KeyGuard::Read(g),
                Err(KeyspaceError::NotFound) => KeyGuard::Missing,
                Err(e) => return Err(e.into()),
            },
            Intent::Write => match keyspace.lock(&key, ctx).await {
                Ok(g) => KeyGuard::Write {
                    guard: g,
                    created: false,
                },
                Err(KeyspaceError::NotFound) => KeyGuard::Missing,
                Err(e) => return Err(e.into()),
            },
            Intent::Create => {
                let (guard, created) = keyspace.create_and_lock(&key, ctx).await?;
                KeyGuard::Write { guard, created }
            }
        };
        guards.insert(key, guard);
    }
    Ok(guards)
}
