//! Hash commands.

use bytes::Bytes;

use kiln_core::types::Scalar;
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{
    as_hash, check_arity, drop_if_empty, float_reply, handler, hash_mut, int, key_at, parse_float,
    parse_int, token_str,
};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "HSET",
            description: "Set one or more hash fields",
            categories: &[Category::Write, Category::Hash, Category::Fast],
            sync: true,
            key_extraction: kx_hset,
            handler: handler!(hset),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HSETNX",
            description: "Set a hash field only when it does not exist",
            categories: &[Category::Write, Category::Hash, Category::Fast],
            sync: true,
            key_extraction: kx_hsetnx,
            handler: handler!(hsetnx),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HGET",
            description: "Get the values of one or more hash fields",
            categories: &[Category::Read, Category::Hash, Category::Fast],
            sync: false,
            key_extraction: kx_read_fields,
            handler: handler!(hget),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HMGET",
            description: "Get the values of one or more hash fields",
            categories: &[Category::Read, Category::Hash, Category::Fast],
            sync: false,
            key_extraction: kx_read_fields,
            handler: handler!(hget),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HDEL",
            description: "Delete one or more hash fields",
            categories: &[Category::Write, Category::Hash, Category::Fast],
            sync: true,
            key_extraction: kx_read_fields_write,
            handler: handler!(hdel),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HLEN",
            description: "Number of fields in a hash",
            categories: &[Category::Read, Category::Hash, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(hlen),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HKEYS",
            description: "All field names of a hash",
            categories: &[Category::Read, Category::Hash, Category::Slow],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(hkeys),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HVALS",
            description: "All values of a hash",
            categories: &[Category::Read, Category::Hash, Category::Slow],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(hvals),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HEXISTS",
            description: "Whether a hash field exists",
            categories: &[Category::Read, Category::Hash, Category::Fast],
            sync: false,
            key_extraction: kx_hexists,
            handler: handler!(hexists),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HGETALL",
            description: "All fields and values of a hash",
            categories: &[Category::Read, Category::Hash, Category::Slow],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(hgetall),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HSTRLEN",
            description: "Length of the value of a hash field",
            categories: &[Category::Read, Category::Hash, Category::Fast],
            sync: false,
            key_extraction: kx_hexists,
            handler: handler!(hstrlen),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HINCRBY",
            description: "Increment the integer value of a hash field",
            categories: &[Category::Write, Category::Hash, Category::Fast],
            sync: true,
            key_extraction: kx_hincrby,
            handler: handler!(hincrby),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HINCRBYFLOAT",
            description: "Increment the float value of a hash field",
            categories: &[Category::Write, Category::Hash, Category::Fast],
            sync: true,
            key_extraction: kx_hincrby,
            handler: handler!(hincrbyfloat),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "HRANDFIELD",
            description: "One or more random fields from a hash",
            categories: &[Category::Read, Category::Hash, Category::Slow],
            sync: false,
            key_extraction: kx_hrandfield,
            handler: handler!(hrandfield),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_hset(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    if tokens.len() < 4 || tokens.len() % 2 != 0 {
        return Err(CommandError::WrongArity("hset"));
    }
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_hsetnx(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "hsetnx")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_read_fields(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "hget")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_read_fields_write(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "hdel")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_one_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "hlen")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_hexists(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "hexists")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_hincrby(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "hincrby")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_hrandfield(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(4), "hrandfield")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

// -- handlers --

async fn hset(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let pairs: Vec<(String, Scalar)> = input.tokens[2..]
        .chunks(2)
        .map(|pair| Ok((token_str(&pair[0])?.to_owned(), Scalar::parse(&pair[1]))))
        .collect::<Result<_, CommandError>>()?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let map = hash_mut(&mut guard, created)?;

    let mut added = 0;
    for (field, value) in pairs {
        if map.insert(field, value).is_none() {
            added += 1;
        }
    }
    Ok(int(added))
}

async fn hsetnx(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let field = token_str(&input.tokens[2])?.to_owned();
    let value = Scalar::parse(&input.tokens[3]);

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let map = hash_mut(&mut guard, created)?;

    if map.contains_key(&field) {
        return Ok(int(0));
    }
    map.insert(field, value);
    Ok(int(1))
}

async fn hget(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let fields = &input.tokens[2..];

    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let map = as_hash(guard.value())?;
            let values = fields
                .iter()
                .map(|field| {
                    let field = token_str(field)?;
                    Ok(match map.get(field) {
                        Some(scalar) => Frame::Bulk(scalar.to_bytes()),
                        None => Frame::Null,
                    })
                })
                .collect::<Result<Vec<_>, CommandError>>()?;
            Ok(Frame::Array(values))
        }
        Err(KeyspaceError::NotFound) => {
            Ok(Frame::Array(fields.iter().map(|_| Frame::Null).collect()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn hdel(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(int(0)),
        Err(e) => return Err(e.into()),
    };

    let map = hash_mut(&mut guard, false)?;
    let mut removed = 0;
    for field in &input.tokens[2..] {
        if map.remove(token_str(field)?).is_some() {
            removed += 1;
        }
    }
    drop_if_empty(keyspace, guard);
    Ok(int(removed))
}

async fn hlen(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_hash(guard.value())?.len() as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn hkeys(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let map = as_hash(guard.value())?;
            Ok(Frame::Array(
                map.keys()
                    .map(|field| Frame::Bulk(Bytes::copy_from_slice(field.as_bytes())))
                    .collect(),
            ))
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn hvals(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let map = as_hash(guard.value())?;
            Ok(Frame::Array(
                map.values()
                    .map(|scalar| Frame::Bulk(scalar.to_bytes()))
                    .collect(),
            ))
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn hexists(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let field = token_str(&input.tokens[2])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_hash(guard.value())?.contains_key(field) as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn hgetall(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let map = as_hash(guard.value())?;
            let mut items = Vec::with_capacity(map.len() * 2);
            for (field, value) in map {
                items.push(Frame::Bulk(Bytes::copy_from_slice(field.as_bytes())));
                items.push(Frame::Bulk(value.to_bytes()));
            }
            Ok(Frame::Array(items))
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn hstrlen(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let field = token_str(&input.tokens[2])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let map = as_hash(guard.value())?;
            Ok(int(map.get(field).map(|s| s.strlen()).unwrap_or(0) as i64))
        }
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn hincrby(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let field = token_str(&input.tokens[2])?.to_owned();
    let delta = parse_int(&input.tokens[3])?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let map = hash_mut(&mut guard, created)?;

    let current = match map.get(&field) {
        None => 0,
        Some(Scalar::Int(n)) => *n,
        Some(_) => return Err(CommandError::value("hash value is not an integer")),
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| CommandError::value("increment or decrement would overflow"))?;
    map.insert(field, Scalar::Int(next));
    Ok(int(next))
}

async fn hincrbyfloat(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let field = token_str(&input.tokens[2])?.to_owned();
    let delta = parse_float(&input.tokens[3])?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let map = hash_mut(&mut guard, created)?;

    let current = match map.get(&field) {
        None => 0.0,
        Some(Scalar::Int(n)) => *n as f64,
        Some(Scalar::Float(f)) => *f,
        Some(Scalar::Str(_)) => {
            return Err(CommandError::value("hash value is not a float"))
        }
    };
    let next = current + delta;
    if !next.is_finite() {
        return Err(CommandError::value("increment would produce NaN or Infinity"));
    }
    map.insert(field, Scalar::Float(next));
    Ok(float_reply(next))
}

async fn hrandfield(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    use rand::seq::IteratorRandom;

    let key = key_at(input.tokens, 1)?;
    let count = match input.tokens.get(2) {
        Some(token) => Some(parse_int(token)?),
        None => None,
    };
    let with_values = match input.tokens.get(3) {
        Some(token) => {
            if !token_str(token)?.eq_ignore_ascii_case("WITHVALUES") {
                return Err(CommandError::value("syntax error"));
            }
            true
        }
        None => false,
    };

    let guard = match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => {
            return Ok(match count {
                None => Frame::Null,
                Some(_) => Frame::Array(Vec::new()),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let map = as_hash(guard.value())?;
    let mut rng = rand::rng();

    match count {
        None => {
            let field = map.keys().choose(&mut rng);
            Ok(match field {
                Some(field) => Frame::Bulk(Bytes::copy_from_slice(field.as_bytes())),
                None => Frame::Null,
            })
        }
        Some(n) => {
            // negative count allows repeats, positive yields distinct fields
            let picks: Vec<&String> = if n < 0 {
                (0..n.unsigned_abs() as usize)
                    .filter_map(|_| map.keys().choose(&mut rng))
                    .collect()
            } else {
                map.keys().choose_multiple(&mut rng, n as usize)
            };
            let mut items = Vec::with_capacity(picks.len() * 2);
            for field in picks {
                items.push(Frame::Bulk(Bytes::copy_from_slice(field.as_bytes())));
                if with_values {
                    if let Some(value) = map.get(field) {
                        items.push(Frame::Bulk(value.to_bytes()));
                    }
                }
            }
            Ok(Frame::Array(items))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use kiln_protocol::Frame;

    #[tokio::test]
    async fn hset_and_hget_multiple_fields() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f1", "v1", "f2", "v2"]).await, 2);

        match run(&d, &["HGET", "h", "f1", "f2", "fX"]).await {
            Frame::Array(items) => {
                assert_eq!(items.len(), 3);
                assert_bulk(&items[0], "v1");
                assert_bulk(&items[1], "v2");
                assert_nil(&items[2]);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hget_missing_key_returns_nils() {
        let d = dispatcher();
        match run(&d, &["HGET", "nope", "a", "b"]).await {
            Frame::Array(items) => {
                assert_eq!(items.len(), 2);
                assert_nil(&items[0]);
                assert_nil(&items[1]);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hset_update_does_not_count() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f", "v1"]).await, 1);
        assert_int(&run(&d, &["HSET", "h", "f", "v2"]).await, 0);
        match run(&d, &["HGET", "h", "f"]).await {
            Frame::Array(items) => assert_bulk(&items[0], "v2"),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hgetall_pairs_fields_and_values() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f1", "v1", "f2", "v2"]).await, 2);
        match run(&d, &["HGETALL", "h"]).await {
            Frame::Array(items) => {
                assert_eq!(items.len(), 4);
                // field order is unspecified; pair up and sort
                let mut pairs: Vec<(String, String)> = items
                    .chunks(2)
                    .map(|pair| match (&pair[0], &pair[1]) {
                        (Frame::Bulk(f), Frame::Bulk(v)) => (
                            String::from_utf8_lossy(f).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        ),
                        other => panic!("expected bulk pair, got {other:?}"),
                    })
                    .collect();
                pairs.sort();
                assert_eq!(
                    pairs,
                    vec![
                        ("f1".into(), "v1".into()),
                        ("f2".into(), "v2".into())
                    ]
                );
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hsetnx_sets_once() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSETNX", "h", "f", "v1"]).await, 1);
        assert_int(&run(&d, &["HSETNX", "h", "f", "v2"]).await, 0);
    }

    #[tokio::test]
    async fn hdel_removes_fields_and_empty_hash() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f1", "v1", "f2", "v2"]).await, 2);
        assert_int(&run(&d, &["HDEL", "h", "f1", "missing"]).await, 1);
        assert_int(&run(&d, &["HLEN", "h"]).await, 1);
        assert_int(&run(&d, &["HDEL", "h", "f2"]).await, 1);
        // removing the last field removes the key
        assert_int(&run(&d, &["EXISTS", "h"]).await, 0);
    }

    #[tokio::test]
    async fn hkeys_hvals_hlen() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "a", "1", "b", "2"]).await, 2);
        assert_int(&run(&d, &["HLEN", "h"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["HKEYS", "h"]).await),
            vec!["a", "b"]
        );
        assert_eq!(
            sorted_members(&run(&d, &["HVALS", "h"]).await),
            vec!["1", "2"]
        );
        assert_int(&run(&d, &["HLEN", "missing"]).await, 0);
    }

    #[tokio::test]
    async fn hexists_and_hstrlen() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "f", "hello"]).await, 1);
        assert_int(&run(&d, &["HEXISTS", "h", "f"]).await, 1);
        assert_int(&run(&d, &["HEXISTS", "h", "x"]).await, 0);
        assert_int(&run(&d, &["HSTRLEN", "h", "f"]).await, 5);
        assert_int(&run(&d, &["HSTRLEN", "h", "x"]).await, 0);
    }

    #[tokio::test]
    async fn hincrby_accumulates() {
        let d = dispatcher();
        assert_int(&run(&d, &["HINCRBY", "h", "n", "5"]).await, 5);
        assert_int(&run(&d, &["HINCRBY", "h", "n", "-2"]).await, 3);
        assert_int(&run(&d, &["HSET", "h", "s", "text"]).await, 1);
        assert_error_contains(&run(&d, &["HINCRBY", "h", "s", "1"]).await, "not an integer");
    }

    #[tokio::test]
    async fn hincrbyfloat_accumulates() {
        let d = dispatcher();
        assert_bulk(&run(&d, &["HINCRBYFLOAT", "h", "f", "1.5"]).await, "1.5");
        assert_bulk(&run(&d, &["HINCRBYFLOAT", "h", "f", "1.5"]).await, "3");
    }

    #[tokio::test]
    async fn hrandfield_shapes() {
        let d = dispatcher();
        assert_int(&run(&d, &["HSET", "h", "a", "1", "b", "2", "c", "3"]).await, 3);

        match run(&d, &["HRANDFIELD", "h"]).await {
            Frame::Bulk(_) => {}
            other => panic!("expected bulk, got {other:?}"),
        }
        match run(&d, &["HRANDFIELD", "h", "2"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
        match run(&d, &["HRANDFIELD", "h", "2", "WITHVALUES"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 4),
            other => panic!("expected array, got {other:?}"),
        }
        assert_nil(&run(&d, &["HRANDFIELD", "missing"]).await);
    }

    #[tokio::test]
    async fn hash_commands_reject_other_types() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "s", "v"]).await);
        assert_error_contains(&run(&d, &["HSET", "s", "f", "v"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["HGETALL", "s"]).await, "WRONGTYPE");
    }
}
