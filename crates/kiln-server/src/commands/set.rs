//! Set commands, including the store variants of the set algebra.
//!
//! Multi-key commands lock every key they touch in ascending key order
//! and read from exactly the guards they locked.

use ahash::AHashSet;
use bytes::Bytes;

use kiln_core::types::Value;
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{
    as_set, check_arity, drop_if_empty, handler, int, key_at, keys_from, parse_count, set_mut,
    token_str, Intent, KeyGuard,
};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "SADD",
            description: "Add members to a set",
            categories: &[Category::Write, Category::Set, Category::Fast],
            sync: true,
            key_extraction: kx_key_members_write,
            handler: handler!(sadd),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SCARD",
            description: "Number of members in a set",
            categories: &[Category::Read, Category::Set, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(scard),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SDIFF",
            description: "Difference of the first set against the rest",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_multi_read,
            handler: handler!(sdiff),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SDIFFSTORE",
            description: "Store the difference of sets in a destination key",
            categories: &[Category::Write, Category::Set, Category::Slow],
            sync: true,
            key_extraction: kx_store,
            handler: handler!(sdiffstore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SINTER",
            description: "Intersection of the given sets",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_multi_read,
            handler: handler!(sinter),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SINTERCARD",
            description: "Cardinality of the intersection of the given sets",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_intercard,
            handler: handler!(sintercard),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SINTERSTORE",
            description: "Store the intersection of sets in a destination key",
            categories: &[Category::Write, Category::Set, Category::Slow],
            sync: true,
            key_extraction: kx_store,
            handler: handler!(sinterstore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SISMEMBER",
            description: "Whether a value is a member of a set",
            categories: &[Category::Read, Category::Set, Category::Fast],
            sync: false,
            key_extraction: kx_key_member_read,
            handler: handler!(sismember),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SMEMBERS",
            description: "All members of a set",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(smembers),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SMISMEMBER",
            description: "Membership test for several values at once",
            categories: &[Category::Read, Category::Set, Category::Fast],
            sync: false,
            key_extraction: kx_key_members_read,
            handler: handler!(smismember),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SMOVE",
            description: "Move a member between sets",
            categories: &[Category::Write, Category::Set, Category::Fast],
            sync: true,
            key_extraction: kx_smove,
            handler: handler!(smove),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SPOP",
            description: "Remove and return random members of a set",
            categories: &[Category::Write, Category::Set, Category::Fast],
            sync: true,
            key_extraction: kx_pop,
            handler: handler!(spop),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SRANDMEMBER",
            description: "Random members of a set without removal",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_pop_read,
            handler: handler!(srandmember),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SREM",
            description: "Remove members from a set",
            categories: &[Category::Write, Category::Set, Category::Fast],
            sync: true,
            key_extraction: kx_key_members_write,
            handler: handler!(srem),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SUNION",
            description: "Union of the given sets",
            categories: &[Category::Read, Category::Set, Category::Slow],
            sync: false,
            key_extraction: kx_multi_read,
            handler: handler!(sunion),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "SUNIONSTORE",
            description: "Store the union of sets in a destination key",
            categories: &[Category::Write, Category::Set, Category::Slow],
            sync: true,
            key_extraction: kx_store,
            handler: handler!(sunionstore),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_key_members_write(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "sadd")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_key_members_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "smismember")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_one_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "scard")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_multi_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, None, "sdiff")?;
    Ok(AccessKeys::read(keys_from(tokens, 1)?))
}

fn kx_intercard(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "sintercard")?;
    let numkeys = super::parse_count(&tokens[1])?;
    if numkeys == 0 || tokens.len() < 2 + numkeys {
        return Err(CommandError::value("numkeys should be greater than 0"));
    }
    Ok(AccessKeys::read(
        tokens[2..2 + numkeys]
            .iter()
            .map(|t| token_str(t).map(str::to_owned))
            .collect::<Result<Vec<_>, _>>()?,
    ))
}

fn kx_store(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "sinterstore")?;
    Ok(AccessKeys {
        write_keys: vec![key_at(tokens, 1)?],
        read_keys: keys_from(tokens, 2)?,
        channels: Vec::new(),
    })
}

fn kx_key_member_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "sismember")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_smove(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "smove")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?, key_at(tokens, 2)?]))
}

fn kx_pop(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(3), "spop")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_pop_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(3), "srandmember")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

// -- algebra core --

/// Locks the given keys (ascending) and snapshots their set contents,
/// returned in the order the keys were given. Missing keys read as
/// empty sets; a wrong-typed key is an error.
async fn snapshot_sets(
    input: &HandlerInput<'_>,
    keys: &[String],
) -> Result<Vec<AHashSet<String>>, CommandError> {
    let wants = keys.iter().map(|k| (k.clone(), Intent::Read)).collect();
    let guards = super::lock_keys(&input.server.keyspace, wants, input.ctx).await?;

    keys.iter()
        .map(|key| match guards.get(key).and_then(KeyGuard::value) {
            Some(value) => Ok(as_set(value)?.clone()),
            None => Ok(AHashSet::new()),
        })
        .collect()
}

fn members_frame(members: impl IntoIterator<Item = String>) -> Frame {
    Frame::Array(
        members
            .into_iter()
            .map(|m| Frame::Bulk(Bytes::from(m)))
            .collect(),
    )
}

fn diff_of(sets: &[AHashSet<String>]) -> AHashSet<String> {
    let mut result = sets[0].clone();
    for other in &sets[1..] {
        result.retain(|m| !other.contains(m));
    }
    result
}

fn inter_of(sets: &[AHashSet<String>]) -> AHashSet<String> {
    let mut result = sets[0].clone();
    for other in &sets[1..] {
        result.retain(|m| other.contains(m));
    }
    result
}

fn union_of(sets: &[AHashSet<String>]) -> AHashSet<String> {
    let mut result = AHashSet::new();
    for set in sets {
        result.extend(set.iter().cloned());
    }
    result
}

/// The store-variant core: locks the destination (create) and every
/// source (read) in one ascending-order pass, computes the result from
/// the locked guards, and overwrites the destination. An empty result
/// removes the destination instead.
async fn store_algebra(
    input: &HandlerInput<'_>,
    combine: fn(&[AHashSet<String>]) -> AHashSet<String>,
) -> Result<Frame, CommandError> {
    let dest = key_at(input.tokens, 1)?;
    let sources = keys_from(input.tokens, 2)?;
    let keyspace = &input.server.keyspace;

    let mut wants: Vec<(String, Intent)> = sources
        .iter()
        .map(|k| (k.clone(), Intent::Read))
        .collect();
    wants.push((dest.clone(), Intent::Create));
    let mut guards = super::lock_keys(keyspace, wants, input.ctx).await?;

    let sets = sources
        .iter()
        .map(|key| match guards.get(key).and_then(KeyGuard::value) {
            Some(value) => Ok(as_set(value)?.clone()),
            None => Ok(AHashSet::new()),
        })
        .collect::<Result<Vec<_>, CommandError>>()?;

    let result = combine(&sets);
    let cardinality = result.len();

    let Some((mut dest_guard, _created)) = guards
        .remove(&dest)
        .and_then(KeyGuard::into_write_with_created)
    else {
        return Err(CommandError::value("destination key lock was lost"));
    };
    dest_guard.set(Value::Set(result));
    drop(guards);
    drop_if_empty(keyspace, dest_guard);

    Ok(int(cardinality as i64))
}

// -- handlers --

async fn sadd(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let members = keys_from(input.tokens, 2)?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let set = set_mut(&mut guard, created)?;

    let mut added = 0;
    for member in members {
        if set.insert(member) {
            added += 1;
        }
    }
    Ok(int(added))
}

async fn scard(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_set(guard.value())?.len() as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn sdiff(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let keys = keys_from(input.tokens, 1)?;
    let sets = snapshot_sets(&input, &keys).await?;
    Ok(members_frame(diff_of(&sets)))
}

async fn sdiffstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, diff_of).await
}

async fn sinter(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let keys = keys_from(input.tokens, 1)?;
    let sets = snapshot_sets(&input, &keys).await?;
    Ok(members_frame(inter_of(&sets)))
}

async fn sintercard(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let numkeys = parse_count(&input.tokens[1])?;
    let keys: Vec<String> = input.tokens[2..2 + numkeys]
        .iter()
        .map(|t| token_str(t).map(str::to_owned))
        .collect::<Result<_, _>>()?;

    // optional LIMIT n
    let mut limit: Option<usize> = None;
    let rest = &input.tokens[2 + numkeys..];
    if !rest.is_empty() {
        if rest.len() != 2 || !token_str(&rest[0])?.eq_ignore_ascii_case("LIMIT") {
            return Err(CommandError::value("syntax error"));
        }
        limit = Some(parse_count(&rest[1])?);
    }

    let sets = snapshot_sets(&input, &keys).await?;
    let cardinality = inter_of(&sets).len();
    Ok(int(match limit {
        Some(0) | None => cardinality as i64,
        Some(limit) => cardinality.min(limit) as i64,
    }))
}

async fn sinterstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, inter_of).await
}

async fn sismember(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let member = token_str(&input.tokens[2])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_set(guard.value())?.contains(member) as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn smembers(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(members_frame(as_set(guard.value())?.iter().cloned())),
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn smismember(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let members = &input.tokens[2..];
    let membership: Vec<bool> = match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let set = as_set(guard.value())?;
            members
                .iter()
                .map(|m| token_str(m).map(|m| set.contains(m)))
                .collect::<Result<_, _>>()?
        }
        Err(KeyspaceError::NotFound) => vec![false; members.len()],
        Err(e) => return Err(e.into()),
    };
    Ok(Frame::Array(
        membership.into_iter().map(|b| int(b as i64)).collect(),
    ))
}

async fn smove(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let source = key_at(input.tokens, 1)?;
    let dest = key_at(input.tokens, 2)?;
    let member = token_str(&input.tokens[3])?.to_owned();
    let keyspace = &input.server.keyspace;

    if source == dest {
        // nothing to move; report membership of the single set
        return match keyspace.rlock(&source, input.ctx).await {
            Ok(guard) => Ok(int(as_set(guard.value())?.contains(&member) as i64)),
            Err(KeyspaceError::NotFound) => Ok(int(0)),
            Err(e) => Err(e.into()),
        };
    }

    let wants = vec![
        (source.clone(), Intent::Write),
        (dest.clone(), Intent::Create),
    ];
    let mut guards = super::lock_keys(keyspace, wants, input.ctx).await?;

    let Some((mut src_guard, _)) = guards
        .remove(&source)
        .and_then(KeyGuard::into_write_with_created)
    else {
        // missing source: clean up the created destination if it's empty
        if let Some((dest_guard, created)) = guards
            .remove(&dest)
            .and_then(KeyGuard::into_write_with_created)
        {
            if created {
                keyspace.delete(dest_guard);
            }
        }
        return Ok(int(0));
    };

    let src_set = set_mut(&mut src_guard, false)?;
    let moved = src_set.remove(&member);

    let Some((mut dest_guard, dest_created)) = guards
        .remove(&dest)
        .and_then(KeyGuard::into_write_with_created)
    else {
        return Err(CommandError::value("destination key lock was lost"));
    };

    if moved {
        let dest_set = set_mut(&mut dest_guard, dest_created)?;
        dest_set.insert(member);
        drop_if_empty(keyspace, src_guard);
        Ok(int(1))
    } else {
        if dest_created {
            keyspace.delete(dest_guard);
        }
        Ok(int(0))
    }
}

async fn spop(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    use rand::seq::IteratorRandom;

    let key = key_at(input.tokens, 1)?;
    let count = match input.tokens.get(2) {
        Some(token) => Some(parse_count(token)?),
        None => None,
    };
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => {
            return Ok(match count {
                None => Frame::Null,
                Some(_) => Frame::Array(Vec::new()),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let set = set_mut(&mut guard, false)?;
    let mut rng = rand::rng();
    let picks: Vec<String> = set
        .iter()
        .choose_multiple(&mut rng, count.unwrap_or(1))
        .into_iter()
        .cloned()
        .collect();
    for member in &picks {
        set.remove(member);
    }
    drop_if_empty(keyspace, guard);

    Ok(match count {
        None => match picks.into_iter().next() {
            Some(member) => Frame::Bulk(Bytes::from(member)),
            None => Frame::Null,
        },
        Some(_) => members_frame(picks),
    })
}

async fn srandmember(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    use rand::seq::IteratorRandom;

    let key = key_at(input.tokens, 1)?;
    let count = match input.tokens.get(2) {
        Some(token) => Some(super::parse_int(token)?),
        None => None,
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

    let set = as_set(guard.value())?;
    let mut rng = rand::rng();
    match count {
        None => Ok(match set.iter().choose(&mut rng) {
            Some(member) => Frame::Bulk(Bytes::from(member.clone())),
            None => Frame::Null,
        }),
        Some(n) if n < 0 => {
            // negative count: members may repeat
            let picks: Vec<String> = (0..n.unsigned_abs() as usize)
                .filter_map(|_| set.iter().choose(&mut rng).cloned())
                .collect();
            Ok(members_frame(picks))
        }
        Some(n) => {
            let picks: Vec<String> = set
                .iter()
                .choose_multiple(&mut rng, n as usize)
                .into_iter()
                .cloned()
                .collect();
            Ok(members_frame(picks))
        }
    }
}

async fn srem(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let members = keys_from(input.tokens, 2)?;
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(int(0)),
        Err(e) => return Err(e.into()),
    };

    let set = set_mut(&mut guard, false)?;
    let mut removed = 0;
    for member in &members {
        if set.remove(member) {
            removed += 1;
        }
    }
    drop_if_empty(keyspace, guard);
    Ok(int(removed))
}

async fn sunion(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let keys = keys_from(input.tokens, 1)?;
    let sets = snapshot_sets(&input, &keys).await?;
    Ok(members_frame(union_of(&sets)))
}

async fn sunionstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, union_of).await
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use kiln_protocol::Frame;

    #[tokio::test]
    async fn sadd_and_smembers() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "s", "a", "b", "c"]).await, 3);
        assert_int(&run(&d, &["SADD", "s", "a", "d"]).await, 1);
        assert_eq!(
            sorted_members(&run(&d, &["SMEMBERS", "s"]).await),
            vec!["a", "b", "c", "d"]
        );
        assert_int(&run(&d, &["SCARD", "s"]).await, 4);
    }

    #[tokio::test]
    async fn sinterstore_stores_intersection() {
        let d = dispatcher();
        assert_int(
            &run(&d, &["SADD", "k1", "one", "two", "three", "four", "five"]).await,
            5,
        );
        assert_int(
            &run(
                &d,
                &["SADD", "k2", "three", "four", "five", "six", "seven", "eight"],
            )
            .await,
            6,
        );

        assert_int(&run(&d, &["SINTERSTORE", "d", "k1", "k2"]).await, 3);
        assert_eq!(
            sorted_members(&run(&d, &["SMEMBERS", "d"]).await),
            vec!["five", "four", "three"]
        );
    }

    #[tokio::test]
    async fn sdiff_and_sdiffstore() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "a", "1", "2", "3"]).await, 3);
        assert_int(&run(&d, &["SADD", "b", "2"]).await, 1);

        assert_eq!(
            sorted_members(&run(&d, &["SDIFF", "a", "b"]).await),
            vec!["1", "3"]
        );
        assert_int(&run(&d, &["SDIFFSTORE", "dest", "a", "b"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["SMEMBERS", "dest"]).await),
            vec!["1", "3"]
        );
    }

    #[tokio::test]
    async fn store_with_empty_result_removes_destination() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "a", "x"]).await, 1);
        assert_int(&run(&d, &["SADD", "dest", "old"]).await, 1);
        // a ∩ missing = empty
        assert_int(&run(&d, &["SINTERSTORE", "dest", "a", "missing"]).await, 0);
        assert_int(&run(&d, &["EXISTS", "dest"]).await, 0);
    }

    #[tokio::test]
    async fn sunion_and_sunionstore() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "a", "1", "2"]).await, 2);
        assert_int(&run(&d, &["SADD", "b", "2", "3"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["SUNION", "a", "b"]).await),
            vec!["1", "2", "3"]
        );
        assert_int(&run(&d, &["SUNIONSTORE", "u", "a", "b"]).await, 3);
    }

    #[tokio::test]
    async fn sintercard_with_limit() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "a", "1", "2", "3"]).await, 3);
        assert_int(&run(&d, &["SADD", "b", "2", "3", "4"]).await, 3);
        assert_int(&run(&d, &["SINTERCARD", "2", "a", "b"]).await, 2);
        assert_int(&run(&d, &["SINTERCARD", "2", "a", "b", "LIMIT", "1"]).await, 1);
    }

    #[tokio::test]
    async fn sismember_and_smismember() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "s", "a", "b"]).await, 2);
        assert_int(&run(&d, &["SISMEMBER", "s", "a"]).await, 1);
        assert_int(&run(&d, &["SISMEMBER", "s", "z"]).await, 0);
        assert_int(&run(&d, &["SISMEMBER", "missing", "a"]).await, 0);

        match run(&d, &["SMISMEMBER", "s", "a", "z"]).await {
            Frame::Array(items) => {
                assert_int(&items[0], 1);
                assert_int(&items[1], 0);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn smove_between_sets() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "src", "a", "b"]).await, 2);
        assert_int(&run(&d, &["SMOVE", "src", "dst", "a"]).await, 1);
        assert_eq!(sorted_members(&run(&d, &["SMEMBERS", "src"]).await), vec!["b"]);
        assert_eq!(sorted_members(&run(&d, &["SMEMBERS", "dst"]).await), vec!["a"]);
        // moving a non-member is a no-op
        assert_int(&run(&d, &["SMOVE", "src", "dst", "zzz"]).await, 0);
        // missing source
        assert_int(&run(&d, &["SMOVE", "ghost", "dst", "a"]).await, 0);
    }

    #[tokio::test]
    async fn smove_last_member_removes_source() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "src", "only"]).await, 1);
        assert_int(&run(&d, &["SMOVE", "src", "dst", "only"]).await, 1);
        assert_int(&run(&d, &["EXISTS", "src"]).await, 0);
    }

    #[tokio::test]
    async fn spop_removes_members() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "s", "a", "b", "c"]).await, 3);

        match run(&d, &["SPOP", "s"]).await {
            Frame::Bulk(_) => {}
            other => panic!("expected bulk, got {other:?}"),
        }
        assert_int(&run(&d, &["SCARD", "s"]).await, 2);

        match run(&d, &["SPOP", "s", "5"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
        // popping everything removes the key
        assert_int(&run(&d, &["EXISTS", "s"]).await, 0);
        assert_nil(&run(&d, &["SPOP", "s"]).await);
    }

    #[tokio::test]
    async fn srandmember_leaves_set_intact() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "s", "a", "b", "c"]).await, 3);
        match run(&d, &["SRANDMEMBER", "s", "2"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
        // negative count may repeat members
        match run(&d, &["SRANDMEMBER", "s", "-5"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 5),
            other => panic!("expected array, got {other:?}"),
        }
        assert_int(&run(&d, &["SCARD", "s"]).await, 3);
    }

    #[tokio::test]
    async fn srem_counts_removed() {
        let d = dispatcher();
        assert_int(&run(&d, &["SADD", "s", "a", "b", "c"]).await, 3);
        assert_int(&run(&d, &["SREM", "s", "a", "z"]).await, 1);
        assert_int(&run(&d, &["SCARD", "s"]).await, 2);
        assert_int(&run(&d, &["SREM", "missing", "a"]).await, 0);
    }

    #[tokio::test]
    async fn set_commands_reject_other_types() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "str", "v"]).await);
        assert_error_contains(&run(&d, &["SADD", "str", "a"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["SMEMBERS", "str"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["SINTERSTORE", "d", "str", "str"]).await, "WRONGTYPE");
    }
}
