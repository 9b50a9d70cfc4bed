//! String commands.

use bytes::Bytes;

use kiln_core::time;
use kiln_core::types::Value;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{
    bulk_str, check_arity, float_reply, handler, int, key_at, ok, parse_float, parse_int,
    scalar_repr, token_str, Intent,
};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "GET",
            description: "Get the string value of a key",
            categories: &[Category::Read, Category::String, Category::Fast],
            sync: false,
            key_extraction: kx_get,
            handler: handler!(get),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SET",
            description: "Set a key to a value with optional expiry and conditions",
            categories: &[Category::Write, Category::String, Category::Slow],
            sync: true,
            key_extraction: kx_set,
            handler: handler!(set),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SETNX",
            description: "Set a key only when it does not already exist",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_setnx,
            handler: handler!(setnx),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "MSET",
            description: "Set several keys atomically",
            categories: &[Category::Write, Category::String, Category::Slow],
            sync: true,
            key_extraction: kx_mset,
            handler: handler!(mset),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SETRANGE",
            description: "Overwrite part of a string at the given offset",
            categories: &[Category::Write, Category::String, Category::Slow],
            sync: true,
            key_extraction: kx_setrange,
            handler: handler!(setrange),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "STRLEN",
            description: "Length of the string stored at a key",
            categories: &[Category::Read, Category::String, Category::Fast],
            sync: false,
            key_extraction: kx_strlen,
            handler: handler!(strlen),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SUBSTR",
            description: "A substring of the string stored at a key",
            categories: &[Category::Read, Category::String, Category::Slow],
            sync: false,
            key_extraction: kx_substr,
            handler: handler!(substr),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "INCR",
            description: "Increment the integer value of a key by one",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_incr,
            handler: handler!(incr),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "DECR",
            description: "Decrement the integer value of a key by one",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_incr,
            handler: handler!(decr),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "INCRBY",
            description: "Increment the integer value of a key",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_incrby,
            handler: handler!(incrby),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "DECRBY",
            description: "Decrement the integer value of a key",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_incrby,
            handler: handler!(decrby),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "INCRBYFLOAT",
            description: "Increment the float value of a key",
            categories: &[Category::Write, Category::String, Category::Fast],
            sync: true,
            key_extraction: kx_incrby,
            handler: handler!(incrbyfloat),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_get(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "get")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_set(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(8), "set")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_setnx(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "setnx")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_mset(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    if tokens.len() < 3 || tokens.len() % 2 != 1 {
        return Err(CommandError::WrongArity("mset"));
    }
    let keys = tokens[1..]
        .iter()
        .step_by(2)
        .map(|t| token_str(t).map(str::to_owned))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AccessKeys::write(keys))
}

fn kx_setrange(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "setrange")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_strlen(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "strlen")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_substr(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "substr")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_incr(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "incr")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_incrby(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "incrby")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

// -- handlers --

async fn get(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(Frame::Bulk(scalar_repr(guard.value())?)),
        Err(kiln_core::KeyspaceError::NotFound) => Ok(Frame::Null),
        Err(e) => Err(e.into()),
    }
}

#[derive(Default)]
struct SetOptions {
    nx: bool,
    xx: bool,
    get: bool,
    /// Absolute expiry in unix ms.
    expire_at_ms: Option<u64>,
}

fn parse_set_options(tokens: &[Bytes]) -> Result<SetOptions, CommandError> {
    let mut opts = SetOptions::default();
    let mut i = 3;
    while i < tokens.len() {
        let opt = token_str(&tokens[i])?.to_ascii_uppercase();
        match opt.as_str() {
            "NX" => opts.nx = true,
            "XX" => opts.xx = true,
            "GET" => opts.get = true,
            "EX" | "PX" | "EXAT" | "PXAT" => {
                i += 1;
                let arg = tokens
                    .get(i)
                    .ok_or(CommandError::value("syntax error"))?;
                let n = parse_int(arg)?;
                if n <= 0 && (opt == "EX" || opt == "PX") {
                    return Err(CommandError::value("invalid expire time in 'set' command"));
                }
                let n = n.max(0) as u64;
                let at = match opt.as_str() {
                    "EX" => time::now_ms().saturating_add(n.saturating_mul(1000)),
                    "PX" => time::now_ms().saturating_add(n),
                    "EXAT" => n.saturating_mul(1000),
                    _ => n,
                };
                if opts.expire_at_ms.replace(at).is_some() {
                    return Err(CommandError::value("syntax error"));
                }
            }
            _ => return Err(CommandError::value("syntax error")),
        }
        i += 1;
    }
    if opts.nx && opts.xx {
        return Err(CommandError::value("syntax error"));
    }
    Ok(opts)
}

async fn set(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let opts = parse_set_options(input.tokens)?;
    let keyspace = &input.server.keyspace;

    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;

    // snapshot the prior value for the GET option before any change
    let previous = if opts.get {
        if created {
            Some(None)
        } else {
            Some(Some(scalar_repr(guard.value())?))
        }
    } else {
        None
    };

    if opts.nx && !created {
        return Ok(reply_blocked(previous));
    }
    if opts.xx && created {
        keyspace.delete(guard);
        return Ok(reply_blocked(previous));
    }

    guard.set(Value::from_token(&input.tokens[2]));
    match opts.expire_at_ms {
        Some(at) => guard.set_expiry(at, true),
        // a plain SET clears any previous TTL
        None => guard.remove_expiry(),
    }

    Ok(match previous {
        Some(Some(old)) => Frame::Bulk(old),
        Some(None) => Frame::Null,
        None => ok(),
    })
}

fn reply_blocked(previous: Option<Option<Bytes>>) -> Frame {
    match previous {
        Some(Some(old)) => Frame::Bulk(old),
        _ => Frame::Null,
    }
}

async fn setnx(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    if !created {
        return Ok(int(0));
    }
    guard.set(Value::from_token(&input.tokens[2]));
    Ok(int(1))
}

async fn mset(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let pairs: Vec<(String, Bytes)> = input.tokens[1..]
        .chunks(2)
        .map(|pair| Ok((token_str(&pair[0])?.to_owned(), pair[1].clone())))
        .collect::<Result<_, CommandError>>()?;

    let wants = pairs
        .iter()
        .map(|(key, _)| (key.clone(), Intent::Create))
        .collect();
    let mut guards = super::lock_keys(&input.server.keyspace, wants, input.ctx).await?;

    for (key, value) in &pairs {
        if let Some(super::KeyGuard::Write { guard, .. }) = guards.get_mut(key) {
            guard.set(Value::from_token(value));
        }
    }
    Ok(ok())
}

async fn setrange(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let offset = parse_int(&input.tokens[2])?;
    if offset < 0 {
        return Err(CommandError::value("offset is out of range"));
    }
    let offset = offset as usize;
    let patch = &input.tokens[3];

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;

    let mut data = if created {
        Vec::new()
    } else {
        scalar_repr(guard.value())?.to_vec()
    };

    if data.len() < offset + patch.len() {
        data.resize(offset + patch.len(), 0);
    }
    data[offset..offset + patch.len()].copy_from_slice(patch);
    let len = data.len();
    guard.set(Value::String(Bytes::from(data)));
    Ok(int(len as i64))
}

async fn strlen(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(scalar_repr(guard.value())?.len() as i64)),
        Err(kiln_core::KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn substr(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let start = parse_int(&input.tokens[2])?;
    let stop = parse_int(&input.tokens[3])?;

    let data = match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => scalar_repr(guard.value())?,
        Err(kiln_core::KeyspaceError::NotFound) => return Ok(bulk_str("")),
        Err(e) => return Err(e.into()),
    };

    let (s, e) = kiln_core::types::normalize_range(start, stop, data.len() as i64);
    if s > e {
        return Ok(bulk_str(""));
    }
    Ok(Frame::Bulk(data.slice(s as usize..=e as usize)))
}

/// Shared INCR/DECR/INCRBY/DECRBY core.
async fn incr_by(input: &HandlerInput<'_>, delta: i64) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;

    let current: i64 = if created {
        0
    } else {
        match guard.value() {
            Value::Int(n) => *n,
            Value::String(data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    CommandError::value("value is not an integer or out of range")
                })?,
            Value::Float(_) => {
                return Err(CommandError::value("value is not an integer or out of range"))
            }
            _ => return Err(CommandError::WrongType),
        }
    };

    let next = current
        .checked_add(delta)
        .ok_or_else(|| CommandError::value("increment or decrement would overflow"))?;
    guard.set(Value::Int(next));
    Ok(int(next))
}

async fn incr(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    incr_by(&input, 1).await
}

async fn decr(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    incr_by(&input, -1).await
}

async fn incrby(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let delta = parse_int(&input.tokens[2])?;
    incr_by(&input, delta).await
}

async fn decrby(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let delta = parse_int(&input.tokens[2])?;
    incr_by(&input, delta.checked_neg().ok_or_else(|| {
        CommandError::value("decrement would overflow")
    })?)
    .await
}

async fn incrbyfloat(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let delta = parse_float(&input.tokens[2])?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;

    let current: f64 = if created {
        0.0
    } else {
        match guard.value() {
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            Value::String(data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CommandError::value("value is not a valid float"))?,
            _ => return Err(CommandError::WrongType),
        }
    };

    let next = current + delta;
    if !next.is_finite() {
        return Err(CommandError::value("increment would produce NaN or Infinity"));
    }
    guard.set(Value::Float(next));
    Ok(float_reply(next))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use kiln_protocol::Frame;

    #[tokio::test]
    async fn set_and_get() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "v"]).await);
        assert_bulk(&run(&d, &["GET", "k"]).await, "v");
    }

    #[tokio::test]
    async fn get_missing_is_nil() {
        let d = dispatcher();
        assert_nil(&run(&d, &["GET", "missing"]).await);
    }

    #[tokio::test]
    async fn adaptive_typing_round_trips() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "n", "42"]).await);
        assert_bulk(&run(&d, &["GET", "n"]).await, "42");
        assert_ok(&run(&d, &["SET", "f", "3.5"]).await);
        assert_bulk(&run(&d, &["GET", "f"]).await, "3.5");
    }

    #[tokio::test]
    async fn set_nx_only_creates() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "first", "NX"]).await);
        assert_nil(&run(&d, &["SET", "k", "second", "NX"]).await);
        assert_bulk(&run(&d, &["GET", "k"]).await, "first");
    }

    #[tokio::test]
    async fn set_xx_only_updates() {
        let d = dispatcher();
        assert_nil(&run(&d, &["SET", "k", "v", "XX"]).await);
        assert_nil(&run(&d, &["GET", "k"]).await);

        assert_ok(&run(&d, &["SET", "k", "v1"]).await);
        assert_ok(&run(&d, &["SET", "k", "v2", "XX"]).await);
        assert_bulk(&run(&d, &["GET", "k"]).await, "v2");
    }

    #[tokio::test]
    async fn set_nx_xx_is_a_syntax_error() {
        let d = dispatcher();
        assert_error_contains(&run(&d, &["SET", "k", "v", "NX", "XX"]).await, "syntax error");
    }

    #[tokio::test]
    async fn set_get_returns_old_value() {
        let d = dispatcher();
        assert_nil(&run(&d, &["SET", "k", "v1", "GET"]).await);
        assert_bulk(&run(&d, &["SET", "k", "v2", "GET"]).await, "v1");
    }

    #[tokio::test]
    async fn set_with_expiry_reports_ttl() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "v", "EX", "100"]).await);
        match run(&d, &["TTL", "k"]).await {
            Frame::Integer(secs) => assert!((98..=100).contains(&secs)),
            other => panic!("expected integer ttl, got {other:?}"),
        }
        // plain SET clears the TTL
        assert_ok(&run(&d, &["SET", "k", "v"]).await);
        assert_int(&run(&d, &["TTL", "k"]).await, -1);
    }

    #[tokio::test]
    async fn setnx_reports_creation() {
        let d = dispatcher();
        assert_int(&run(&d, &["SETNX", "k", "a"]).await, 1);
        assert_int(&run(&d, &["SETNX", "k", "b"]).await, 0);
        assert_bulk(&run(&d, &["GET", "k"]).await, "a");
    }

    #[tokio::test]
    async fn mset_sets_all_pairs() {
        let d = dispatcher();
        assert_ok(&run(&d, &["MSET", "a", "1", "b", "2", "c", "3"]).await);
        assert_bulk(&run(&d, &["GET", "a"]).await, "1");
        assert_bulk(&run(&d, &["GET", "b"]).await, "2");
        assert_bulk(&run(&d, &["GET", "c"]).await, "3");
    }

    #[tokio::test]
    async fn mset_odd_args_is_wrong_arity() {
        let d = dispatcher();
        assert_error_contains(
            &run(&d, &["MSET", "a", "1", "b"]).await,
            "wrong number of arguments",
        );
    }

    #[tokio::test]
    async fn setrange_extends_with_zeroes() {
        let d = dispatcher();
        assert_int(&run(&d, &["SETRANGE", "k", "5", "world"]).await, 10);
        match run(&d, &["GET", "k"]).await {
            Frame::Bulk(data) => assert_eq!(&data[..], b"\0\0\0\0\0world"),
            other => panic!("expected bulk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn setrange_overwrites_in_place() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "hello world"]).await);
        assert_int(&run(&d, &["SETRANGE", "k", "6", "kiln!"]).await, 11);
        assert_bulk(&run(&d, &["GET", "k"]).await, "hello kiln!");
    }

    #[tokio::test]
    async fn strlen_counts_bytes() {
        let d = dispatcher();
        assert_int(&run(&d, &["STRLEN", "missing"]).await, 0);
        assert_ok(&run(&d, &["SET", "k", "hello"]).await);
        assert_int(&run(&d, &["STRLEN", "k"]).await, 5);
        // integer values report their rendered length
        assert_ok(&run(&d, &["SET", "n", "1234"]).await);
        assert_int(&run(&d, &["STRLEN", "n"]).await, 4);
    }

    #[tokio::test]
    async fn substr_supports_negative_indices() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "hello"]).await);
        assert_bulk(&run(&d, &["SUBSTR", "k", "0", "1"]).await, "he");
        assert_bulk(&run(&d, &["SUBSTR", "k", "-3", "-1"]).await, "llo");
        assert_bulk(&run(&d, &["SUBSTR", "k", "3", "1"]).await, "");
        assert_bulk(&run(&d, &["SUBSTR", "missing", "0", "-1"]).await, "");
    }

    #[tokio::test]
    async fn incr_family() {
        let d = dispatcher();
        assert_int(&run(&d, &["INCR", "n"]).await, 1);
        assert_int(&run(&d, &["INCR", "n"]).await, 2);
        assert_int(&run(&d, &["INCRBY", "n", "10"]).await, 12);
        assert_int(&run(&d, &["DECR", "n"]).await, 11);
        assert_int(&run(&d, &["DECRBY", "n", "5"]).await, 6);
    }

    #[tokio::test]
    async fn incr_non_integer_errors() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "k", "not-a-number"]).await);
        assert_error_contains(&run(&d, &["INCR", "k"]).await, "not an integer");
    }

    #[tokio::test]
    async fn incr_overflow_errors() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "n", &i64::MAX.to_string()]).await);
        assert_error_contains(&run(&d, &["INCR", "n"]).await, "overflow");
    }

    #[tokio::test]
    async fn incrbyfloat_accumulates() {
        let d = dispatcher();
        assert_bulk(&run(&d, &["INCRBYFLOAT", "f", "1.5"]).await, "1.5");
        assert_bulk(&run(&d, &["INCRBYFLOAT", "f", "2.25"]).await, "3.75");
        // integral results render without a decimal point
        assert_bulk(&run(&d, &["INCRBYFLOAT", "f", "0.25"]).await, "4");
    }

    #[tokio::test]
    async fn incrbyfloat_rejects_nan_producing_input() {
        let d = dispatcher();
        assert_bulk(&run(&d, &["INCRBYFLOAT", "f", "inf"]).await, "inf");
        assert_error_contains(
            &run(&d, &["INCRBYFLOAT", "f", "-inf"]).await,
            "NaN or Infinity",
        );
    }

    #[tokio::test]
    async fn writes_under_memory_pressure_evict_lru_first() {
        use kiln_core::keyspace::{EvictionPolicy, StoreConfig};

        let d = dispatcher_with(StoreConfig {
            max_memory: 8 * 1024,
            eviction_policy: EvictionPolicy::AllKeysLru,
            ..StoreConfig::default()
        });

        // write well past the limit in access order k1..kN
        let filler = "v".repeat(128);
        for i in 1..=40 {
            run(&d, &["SET", &format!("k{i}"), &filler]).await;
        }

        // the earliest keys were evicted; the latest survive
        assert_nil(&run(&d, &["GET", "k1"]).await);
        match run(&d, &["GET", "k40"]).await {
            Frame::Bulk(data) => assert_eq!(data.len(), 128),
            other => panic!("expected bulk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn string_commands_reject_containers() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f", "v"]).await, 1);
        assert_error_contains(&run(&d, &["GET", "h"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["INCR", "h"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["STRLEN", "h"]).await, "WRONGTYPE");
    }
}
