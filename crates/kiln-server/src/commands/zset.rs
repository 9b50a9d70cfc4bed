//! Sorted-set commands.
//!
//! Set algebra over sorted sets aggregates scores by summing (the
//! Redis default); difference keeps the first set's scores. Store
//! variants lock the destination and every source in one ascending
//! pass and read from exactly the locked guards.

use ahash::AHashMap;
use bytes::Bytes;

use kiln_core::types::sorted_set::{LexBound, LexRange, ScoreBound, ScoreRange, ZAddFlags};
use kiln_core::types::{format_float, SortedSet, Value};
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{
    as_zset, check_arity, drop_if_empty, float_reply, handler, int, key_at, parse_count,
    parse_float, parse_int, token_str, zset_mut, Intent, KeyGuard,
};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "ZADD",
            description: "Add members to a sorted set with flag semantics",
            categories: &[Category::Write, Category::SortedSet, Category::Fast],
            sync: true,
            key_extraction: kx_one_write_multi,
            handler: handler!(zadd),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZCARD",
            description: "Number of members in a sorted set",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(zcard),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZCOUNT",
            description: "Count members within a score range",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_range_read,
            handler: handler!(zcount),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZDIFF",
            description: "Difference of sorted sets",
            categories: &[Category::Read, Category::SortedSet, Category::Slow],
            sync: false,
            key_extraction: kx_numkeys_read,
            handler: handler!(zdiff),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZDIFFSTORE",
            description: "Store the difference of sorted sets",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_numkeys_store,
            handler: handler!(zdiffstore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZINCRBY",
            description: "Increment a member's score",
            categories: &[Category::Write, Category::SortedSet, Category::Fast],
            sync: true,
            key_extraction: kx_zincrby,
            handler: handler!(zincrby),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZINTER",
            description: "Intersection of sorted sets",
            categories: &[Category::Read, Category::SortedSet, Category::Slow],
            sync: false,
            key_extraction: kx_numkeys_read,
            handler: handler!(zinter),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZINTERSTORE",
            description: "Store the intersection of sorted sets",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_numkeys_store,
            handler: handler!(zinterstore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZUNION",
            description: "Union of sorted sets",
            categories: &[Category::Read, Category::SortedSet, Category::Slow],
            sync: false,
            key_extraction: kx_numkeys_read,
            handler: handler!(zunion),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZUNIONSTORE",
            description: "Store the union of sorted sets",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_numkeys_store,
            handler: handler!(zunionstore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZLEXCOUNT",
            description: "Count members within a lexicographic range",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_range_read,
            handler: handler!(zlexcount),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZRANGE",
            description: "Members in a rank range",
            categories: &[Category::Read, Category::SortedSet, Category::Slow],
            sync: false,
            key_extraction: kx_zrange,
            handler: handler!(zrange),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZRANK",
            description: "Rank of a member, lowest score first",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_member_read,
            handler: handler!(zrank),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZREM",
            description: "Remove members from a sorted set",
            categories: &[Category::Write, Category::SortedSet, Category::Fast],
            sync: true,
            key_extraction: kx_one_write_multi,
            handler: handler!(zrem),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZSCORE",
            description: "Score of a member",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_member_read,
            handler: handler!(zscore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZMSCORE",
            description: "Scores of several members",
            categories: &[Category::Read, Category::SortedSet, Category::Fast],
            sync: false,
            key_extraction: kx_member_read_multi,
            handler: handler!(zmscore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZRANDMEMBER",
            description: "Random members of a sorted set",
            categories: &[Category::Read, Category::SortedSet, Category::Slow],
            sync: false,
            key_extraction: kx_zrandmember,
            handler: handler!(zrandmember),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZPOPMIN",
            description: "Remove and return the lowest-scoring members",
            categories: &[Category::Write, Category::SortedSet, Category::Fast],
            sync: true,
            key_extraction: kx_pop,
            handler: handler!(zpopmin),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZPOPMAX",
            description: "Remove and return the highest-scoring members",
            categories: &[Category::Write, Category::SortedSet, Category::Fast],
            sync: true,
            key_extraction: kx_pop,
            handler: handler!(zpopmax),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZREMRANGEBYSCORE",
            description: "Remove members within a score range",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_range_write,
            handler: handler!(zremrangebyscore),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZREMRANGEBYRANK",
            description: "Remove members within a rank range",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_range_write,
            handler: handler!(zremrangebyrank),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ZREMRANGEBYLEX",
            description: "Remove members within a lexicographic range",
            categories: &[Category::Write, Category::SortedSet, Category::Slow],
            sync: true,
            key_extraction: kx_range_write,
            handler: handler!(zremrangebylex),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_one_write_multi(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "zadd")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_one_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "zcard")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_range_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "zcount")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_range_write(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "zremrangebyscore")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_member_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "zscore")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_member_read_multi(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "zmscore")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_zincrby(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "zincrby")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_zrange(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(5), "zrange")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_zrandmember(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(4), "zrandmember")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_pop(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(3), "zpopmin")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

/// Parses the `numkeys key [key ...]` tail shared by the algebra
/// commands; `start` is the token index of `numkeys`.
fn numkeys_keys(tokens: &[Bytes], start: usize) -> Result<Vec<String>, CommandError> {
    let numkeys = parse_count(&tokens[start])?;
    if numkeys == 0 {
        return Err(CommandError::value("numkeys should be greater than 0"));
    }
    if tokens.len() < start + 1 + numkeys {
        return Err(CommandError::value("syntax error"));
    }
    tokens[start + 1..start + 1 + numkeys]
        .iter()
        .map(|t| token_str(t).map(str::to_owned))
        .collect()
}

fn kx_numkeys_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "zdiff")?;
    Ok(AccessKeys::read(numkeys_keys(tokens, 1)?))
}

fn kx_numkeys_store(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, None, "zdiffstore")?;
    Ok(AccessKeys {
        write_keys: vec![key_at(tokens, 1)?],
        read_keys: numkeys_keys(tokens, 2)?,
        channels: Vec::new(),
    })
}

// -- parsing helpers --

fn parse_score_bound(token: &Bytes) -> Result<ScoreBound, CommandError> {
    let s = token_str(token)?;
    if let Some(rest) = s.strip_prefix('(') {
        let value = parse_float(&Bytes::copy_from_slice(rest.as_bytes()))?;
        Ok(ScoreBound::exclusive(value))
    } else {
        Ok(ScoreBound::inclusive(parse_float(token)?))
    }
}

fn parse_score_range(min: &Bytes, max: &Bytes) -> Result<ScoreRange, CommandError> {
    Ok(ScoreRange {
        min: parse_score_bound(min)?,
        max: parse_score_bound(max)?,
    })
}

fn parse_lex_bound(token: &Bytes) -> Result<LexBound, CommandError> {
    let s = token_str(token)?;
    match s {
        "-" => Ok(LexBound::NegInfinity),
        "+" => Ok(LexBound::PosInfinity),
        _ => {
            if let Some(member) = s.strip_prefix('[') {
                Ok(LexBound::Inclusive(member.to_owned()))
            } else if let Some(member) = s.strip_prefix('(') {
                Ok(LexBound::Exclusive(member.to_owned()))
            } else {
                Err(CommandError::value("min or max not valid string range item"))
            }
        }
    }
}

fn parse_lex_range(min: &Bytes, max: &Bytes) -> Result<LexRange, CommandError> {
    Ok(LexRange {
        min: parse_lex_bound(min)?,
        max: parse_lex_bound(max)?,
    })
}

/// Flat `member, score, member, score, ...` array.
fn pairs_frame(pairs: impl IntoIterator<Item = (String, f64)>) -> Frame {
    let mut items = Vec::new();
    for (member, score) in pairs {
        items.push(Frame::Bulk(Bytes::from(member)));
        items.push(Frame::Bulk(Bytes::from(format_float(score))));
    }
    Frame::Array(items)
}

fn members_only_frame(members: impl IntoIterator<Item = String>) -> Frame {
    Frame::Array(
        members
            .into_iter()
            .map(|m| Frame::Bulk(Bytes::from(m)))
            .collect(),
    )
}

// -- algebra core --

type ScoreMap = AHashMap<String, f64>;

/// Snapshots the member→score maps of the given keys under one
/// ascending-order lock pass. Missing keys read as empty.
async fn snapshot_zsets(
    input: &HandlerInput<'_>,
    keys: &[String],
) -> Result<Vec<ScoreMap>, CommandError> {
    let wants = keys.iter().map(|k| (k.clone(), Intent::Read)).collect();
    let guards = super::lock_keys(&input.server.keyspace, wants, input.ctx).await?;
    snapshot_from_guards(&guards, keys)
}

fn snapshot_from_guards(
    guards: &AHashMap<String, KeyGuard>,
    keys: &[String],
) -> Result<Vec<ScoreMap>, CommandError> {
    keys.iter()
        .map(|key| match guards.get(key).and_then(KeyGuard::value) {
            Some(value) => Ok(as_zset(value)?
                .iter()
                .map(|(m, s)| (m.to_owned(), s))
                .collect()),
            None => Ok(ScoreMap::new()),
        })
        .collect()
}

fn zdiff_of(maps: &[ScoreMap]) -> SortedSet {
    let mut result = SortedSet::new();
    'member: for (member, score) in &maps[0] {
        for other in &maps[1..] {
            if other.contains_key(member) {
                continue 'member;
            }
        }
        result.add(member.clone(), *score);
    }
    result
}

fn zinter_of(maps: &[ScoreMap]) -> SortedSet {
    let mut result = SortedSet::new();
    'member: for (member, score) in &maps[0] {
        let mut total = *score;
        for other in &maps[1..] {
            match other.get(member) {
                Some(s) => total += s,
                None => continue 'member,
            }
        }
        result.add(member.clone(), total);
    }
    result
}

fn zunion_of(maps: &[ScoreMap]) -> SortedSet {
    let mut totals: ScoreMap = ScoreMap::new();
    for map in maps {
        for (member, score) in map {
            *totals.entry(member.clone()).or_insert(0.0) += score;
        }
    }
    let mut result = SortedSet::new();
    for (member, score) in totals {
        result.add(member, score);
    }
    result
}

/// Reply for the non-store algebra commands, honoring WITHSCORES.
fn algebra_reply(result: SortedSet, with_scores: bool) -> Frame {
    if with_scores {
        pairs_frame(result.iter().map(|(m, s)| (m.to_owned(), s)))
    } else {
        members_only_frame(result.iter().map(|(m, _)| m.to_owned()))
    }
}

fn withscores_flag(tokens: &[Bytes], idx: usize) -> Result<bool, CommandError> {
    match tokens.get(idx) {
        None => Ok(false),
        Some(token) if token_str(token)?.eq_ignore_ascii_case("WITHSCORES") => Ok(true),
        Some(_) => Err(CommandError::value("syntax error")),
    }
}

async fn read_algebra(
    input: &HandlerInput<'_>,
    combine: fn(&[ScoreMap]) -> SortedSet,
) -> Result<Frame, CommandError> {
    let keys = numkeys_keys(input.tokens, 1)?;
    let with_scores = withscores_flag(input.tokens, 2 + keys.len())?;
    let maps = snapshot_zsets(input, &keys).await?;
    Ok(algebra_reply(combine(&maps), with_scores))
}

async fn store_algebra(
    input: &HandlerInput<'_>,
    combine: fn(&[ScoreMap]) -> SortedSet,
) -> Result<Frame, CommandError> {
    let dest = key_at(input.tokens, 1)?;
    let sources = numkeys_keys(input.tokens, 2)?;
    let keyspace = &input.server.keyspace;

    let mut wants: Vec<(String, Intent)> = sources
        .iter()
        .map(|k| (k.clone(), Intent::Read))
        .collect();
    wants.push((dest.clone(), Intent::Create));
    let mut guards = super::lock_keys(keyspace, wants, input.ctx).await?;

    let maps = snapshot_from_guards(&guards, &sources)?;
    let result = combine(&maps);
    let cardinality = result.len();

    let Some((mut dest_guard, _created)) = guards
        .remove(&dest)
        .and_then(KeyGuard::into_write_with_created)
    else {
        return Err(CommandError::value("destination key lock was lost"));
    };
    dest_guard.set(Value::SortedSet(result));
    drop(guards);
    drop_if_empty(keyspace, dest_guard);

    Ok(int(cardinality as i64))
}

// -- handlers --

struct ZAddArgs {
    flags: ZAddFlags,
    incr: bool,
    members: Vec<(f64, String)>,
}

/// Parses ZADD's flag prefix and score/member tail, enforcing flag
/// compatibility: NX excludes XX and GT/LT, GT excludes LT, and INCR
/// allows exactly one score/member pair.
fn parse_zadd(tokens: &[Bytes]) -> Result<ZAddArgs, CommandError> {
    let mut flags = ZAddFlags::default();
    let mut incr = false;
    let mut i = 2;

    while i < tokens.len() {
        match token_str(&tokens[i])?.to_ascii_uppercase().as_str() {
            "NX" => flags.nx = true,
            "XX" => flags.xx = true,
            "GT" => flags.gt = true,
            "LT" => flags.lt = true,
            "CH" => flags.ch = true,
            "INCR" => incr = true,
            _ => break,
        }
        i += 1;
    }

    if flags.nx && (flags.xx || flags.gt || flags.lt) {
        return Err(CommandError::value(
            "GT, LT, and/or NX options at the same time are not compatible",
        ));
    }
    if flags.gt && flags.lt {
        return Err(CommandError::value(
            "GT, LT, and/or NX options at the same time are not compatible",
        ));
    }

    let tail = &tokens[i..];
    if tail.is_empty() || tail.len() % 2 != 0 {
        return Err(CommandError::value("syntax error"));
    }
    if incr && tail.len() != 2 {
        return Err(CommandError::value(
            "INCR option supports a single increment-element pair",
        ));
    }

    let members = tail
        .chunks(2)
        .map(|pair| Ok((parse_float(&pair[0])?, token_str(&pair[1])?.to_owned())))
        .collect::<Result<Vec<_>, CommandError>>()?;

    Ok(ZAddArgs {
        flags,
        incr,
        members,
    })
}

async fn zadd(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let args = parse_zadd(input.tokens)?;

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let zset = zset_mut(&mut guard, created)?;

    if args.incr {
        let (delta, member) = &args.members[0];
        let result = zset.incr(member, *delta, &args.flags);
        // XX on an empty new key leaves nothing behind
        drop_if_empty(keyspace, guard);
        return Ok(match result {
            Some(score) => float_reply(score),
            None => Frame::Null,
        });
    }

    let mut added = 0;
    let mut changed = 0;
    for (score, member) in args.members {
        let result = zset.add_with_flags(member, score, &args.flags);
        if result.added {
            added += 1;
        }
        if result.added || result.updated {
            changed += 1;
        }
    }
    let count = if args.flags.ch { changed } else { added };
    drop_if_empty(keyspace, guard);
    Ok(int(count))
}

async fn zcard(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_zset(guard.value())?.len() as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn zcount(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let range = parse_score_range(&input.tokens[2], &input.tokens[3])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_zset(guard.value())?.count_by_score(&range) as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn zdiff(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    read_algebra(&input, zdiff_of).await
}

async fn zdiffstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, zdiff_of).await
}

async fn zincrby(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let delta = parse_float(&input.tokens[2])?;
    let member = token_str(&input.tokens[3])?.to_owned();

    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let zset = zset_mut(&mut guard, created)?;

    let score = zset
        .incr(&member, delta, &ZAddFlags::default())
        .ok_or_else(|| CommandError::value("increment was suppressed"))?;
    Ok(float_reply(score))
}

async fn zinter(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    read_algebra(&input, zinter_of).await
}

async fn zinterstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, zinter_of).await
}

async fn zunion(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    read_algebra(&input, zunion_of).await
}

async fn zunionstore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    store_algebra(&input, zunion_of).await
}

async fn zlexcount(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let range = parse_lex_range(&input.tokens[2], &input.tokens[3])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_zset(guard.value())?.count_by_lex(&range) as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn zrange(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let start = parse_int(&input.tokens[2])?;
    let stop = parse_int(&input.tokens[3])?;
    let with_scores = withscores_flag(input.tokens, 4)?;

    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let zset = as_zset(guard.value())?;
            let range = zset.range_by_rank(start, stop);
            Ok(if with_scores {
                pairs_frame(range.into_iter().map(|(m, s)| (m.to_owned(), s)))
            } else {
                members_only_frame(range.into_iter().map(|(m, _)| m.to_owned()))
            })
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn zrank(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let member = token_str(&input.tokens[2])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(match as_zset(guard.value())?.rank(member) {
            Some(rank) => int(rank as i64),
            None => Frame::Null,
        }),
        Err(KeyspaceError::NotFound) => Ok(Frame::Null),
        Err(e) => Err(e.into()),
    }
}

async fn zrem(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(int(0)),
        Err(e) => return Err(e.into()),
    };

    let zset = zset_mut(&mut guard, false)?;
    let mut removed = 0;
    for member in &input.tokens[2..] {
        if zset.remove(token_str(member)?) {
            removed += 1;
        }
    }
    drop_if_empty(keyspace, guard);
    Ok(int(removed))
}

async fn zscore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let member = token_str(&input.tokens[2])?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(match as_zset(guard.value())?.score(member) {
            Some(score) => float_reply(score),
            None => Frame::Null,
        }),
        Err(KeyspaceError::NotFound) => Ok(Frame::Null),
        Err(e) => Err(e.into()),
    }
}

async fn zmscore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let members = &input.tokens[2..];
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let zset = as_zset(guard.value())?;
            let scores = members
                .iter()
                .map(|m| {
                    Ok(match zset.score(token_str(m)?) {
                        Some(score) => float_reply(score),
                        None => Frame::Null,
                    })
                })
                .collect::<Result<Vec<_>, CommandError>>()?;
            Ok(Frame::Array(scores))
        }
        Err(KeyspaceError::NotFound) => {
            Ok(Frame::Array(members.iter().map(|_| Frame::Null).collect()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn zrandmember(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let count = match input.tokens.get(2) {
        Some(token) => Some(parse_count(token)?),
        None => None,
    };
    let with_scores = withscores_flag(input.tokens, 3)?;

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

    let zset = as_zset(guard.value())?;
    let picks = zset.random_members(count.unwrap_or(1));
    Ok(match count {
        None => match picks.first() {
            Some((member, _)) => Frame::Bulk(Bytes::copy_from_slice(member.as_bytes())),
            None => Frame::Null,
        },
        Some(_) if with_scores => {
            pairs_frame(picks.into_iter().map(|(m, s)| (m.to_owned(), s)))
        }
        Some(_) => members_only_frame(picks.into_iter().map(|(m, _)| m.to_owned())),
    })
}

async fn zpop(input: HandlerInput<'_>, min: bool) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let count = match input.tokens.get(2) {
        Some(token) => parse_count(token)?,
        None => 1,
    };
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(Frame::Array(Vec::new())),
        Err(e) => return Err(e.into()),
    };

    let zset = zset_mut(&mut guard, false)?;
    let popped = if min {
        zset.pop_min(count)
    } else {
        zset.pop_max(count)
    };
    drop_if_empty(keyspace, guard);
    Ok(pairs_frame(popped))
}

async fn zpopmin(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    zpop(input, true).await
}

async fn zpopmax(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    zpop(input, false).await
}

/// Shared removal wrapper for the ZREMRANGEBY* commands.
async fn zremrange(
    input: &HandlerInput<'_>,
    remove: impl FnOnce(&mut SortedSet) -> usize,
) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(int(0)),
        Err(e) => return Err(e.into()),
    };
    let zset = zset_mut(&mut guard, false)?;
    let removed = remove(zset);
    drop_if_empty(keyspace, guard);
    Ok(int(removed as i64))
}

async fn zremrangebyscore(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let range = parse_score_range(&input.tokens[2], &input.tokens[3])?;
    zremrange(&input, |zset| zset.remove_range_by_score(&range)).await
}

async fn zremrangebyrank(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let start = parse_int(&input.tokens[2])?;
    let stop = parse_int(&input.tokens[3])?;
    zremrange(&input, |zset| zset.remove_range_by_rank(start, stop)).await
}

async fn zremrangebylex(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let range = parse_lex_range(&input.tokens[2], &input.tokens[3])?;
    zremrange(&input, |zset| zset.remove_range_by_lex(&range)).await
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use kiln_protocol::Frame;

    fn pairs(frame: &Frame) -> Vec<(String, String)> {
        match frame {
            Frame::Array(items) => items
                .chunks(2)
                .map(|pair| match (&pair[0], &pair[1]) {
                    (Frame::Bulk(m), Frame::Bulk(s)) => (
                        String::from_utf8_lossy(m).into_owned(),
                        String::from_utf8_lossy(s).into_owned(),
                    ),
                    other => panic!("expected bulk pair, got {other:?}"),
                })
                .collect(),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zadd_and_basic_queries() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]).await, 3);
        assert_int(&run(&d, &["ZCARD", "z"]).await, 3);
        assert_bulk(&run(&d, &["ZSCORE", "z", "b"]).await, "2");
        assert_nil(&run(&d, &["ZSCORE", "z", "missing"]).await);
        assert_int(&run(&d, &["ZRANK", "z", "a"]).await, 0);
        assert_int(&run(&d, &["ZRANK", "z", "c"]).await, 2);
        assert_nil(&run(&d, &["ZRANK", "z", "missing"]).await);
    }

    #[tokio::test]
    async fn zadd_xx_lt_ch_updates_downward_only() {
        let d = dispatcher();
        assert_int(
            &run(&d, &["ZADD", "z", "5.5", "m1", "67.77", "m2", "10", "m3"]).await,
            3,
        );

        // only m1 moves (downward); m4/m5 are blocked by XX
        assert_int(
            &run(
                &d,
                &["ZADD", "z", "XX", "LT", "CH", "3.5", "m1", "100.5", "m4", "15", "m5"],
            )
            .await,
            1,
        );

        assert_bulk(&run(&d, &["ZSCORE", "z", "m1"]).await, "3.5");
        assert_bulk(&run(&d, &["ZSCORE", "z", "m2"]).await, "67.77");
        assert_bulk(&run(&d, &["ZSCORE", "z", "m3"]).await, "10");
        assert_int(&run(&d, &["ZCARD", "z"]).await, 3);
    }

    #[tokio::test]
    async fn zadd_flag_conflicts_error() {
        let d = dispatcher();
        assert_error_contains(
            &run(&d, &["ZADD", "z", "NX", "XX", "1", "m"]).await,
            "not compatible",
        );
        assert_error_contains(
            &run(&d, &["ZADD", "z", "NX", "GT", "1", "m"]).await,
            "not compatible",
        );
        assert_error_contains(
            &run(&d, &["ZADD", "z", "GT", "LT", "1", "m"]).await,
            "not compatible",
        );
        assert_error_contains(
            &run(&d, &["ZADD", "z", "INCR", "1", "a", "2", "b"]).await,
            "single increment-element pair",
        );
    }

    #[tokio::test]
    async fn zadd_incr_returns_new_score() {
        let d = dispatcher();
        assert_bulk(&run(&d, &["ZADD", "z", "INCR", "2.5", "m"]).await, "2.5");
        assert_bulk(&run(&d, &["ZADD", "z", "INCR", "1.5", "m"]).await, "4");
        // NX suppresses the increment for an existing member
        assert_nil(&run(&d, &["ZADD", "z", "NX", "INCR", "1", "m"]).await);
    }

    #[tokio::test]
    async fn zincrby_accumulates() {
        let d = dispatcher();
        assert_bulk(&run(&d, &["ZINCRBY", "z", "3", "m"]).await, "3");
        assert_bulk(&run(&d, &["ZINCRBY", "z", "-1.5", "m"]).await, "1.5");
    }

    #[tokio::test]
    async fn zcount_score_ranges() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]).await, 3);
        assert_int(&run(&d, &["ZCOUNT", "z", "-inf", "+inf"]).await, 3);
        assert_int(&run(&d, &["ZCOUNT", "z", "2", "3"]).await, 2);
        assert_int(&run(&d, &["ZCOUNT", "z", "(2", "3"]).await, 1);
        assert_int(&run(&d, &["ZCOUNT", "missing", "-inf", "+inf"]).await, 0);
    }

    #[tokio::test]
    async fn zrange_with_scores() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "3", "c", "1", "a", "2", "b"]).await, 3);
        assert_eq!(
            sorted_members(&run(&d, &["ZRANGE", "z", "0", "-1"]).await),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            pairs(&run(&d, &["ZRANGE", "z", "0", "1", "WITHSCORES"]).await),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[tokio::test]
    async fn zrem_and_empty_cleanup() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b"]).await, 2);
        assert_int(&run(&d, &["ZREM", "z", "a", "missing"]).await, 1);
        assert_int(&run(&d, &["ZREM", "z", "b"]).await, 1);
        assert_int(&run(&d, &["EXISTS", "z"]).await, 0);
    }

    #[tokio::test]
    async fn zmscore_mixed_membership() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a"]).await, 1);
        match run(&d, &["ZMSCORE", "z", "a", "missing"]).await {
            Frame::Array(items) => {
                assert_bulk(&items[0], "1");
                assert_nil(&items[1]);
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zpopmin_and_zpopmax() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]).await, 3);
        assert_eq!(
            pairs(&run(&d, &["ZPOPMIN", "z"]).await),
            vec![("a".into(), "1".into())]
        );
        assert_eq!(
            pairs(&run(&d, &["ZPOPMAX", "z"]).await),
            vec![("c".into(), "3".into())]
        );
        assert_int(&run(&d, &["ZCARD", "z"]).await, 1);
        // popping the rest removes the key
        assert_eq!(
            pairs(&run(&d, &["ZPOPMIN", "z", "10"]).await),
            vec![("b".into(), "2".into())]
        );
        assert_int(&run(&d, &["EXISTS", "z"]).await, 0);
    }

    #[tokio::test]
    async fn zlexcount_and_zremrangebylex() {
        let d = dispatcher();
        assert_int(
            &run(&d, &["ZADD", "z", "0", "a", "0", "b", "0", "c", "0", "d"]).await,
            4,
        );
        assert_int(&run(&d, &["ZLEXCOUNT", "z", "-", "+"]).await, 4);
        assert_int(&run(&d, &["ZLEXCOUNT", "z", "[b", "[c"]).await, 2);
        assert_int(&run(&d, &["ZLEXCOUNT", "z", "(b", "+"]).await, 2);
        assert_int(&run(&d, &["ZREMRANGEBYLEX", "z", "[a", "[b"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["ZRANGE", "z", "0", "-1"]).await),
            vec!["c", "d"]
        );
    }

    #[tokio::test]
    async fn zremrangebyscore_and_byrank() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]).await, 3);
        assert_int(&run(&d, &["ZREMRANGEBYSCORE", "z", "2", "3"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["ZRANGE", "z", "0", "-1"]).await),
            vec!["a"]
        );

        assert_int(&run(&d, &["ZADD", "z", "2", "b", "3", "c"]).await, 2);
        assert_int(&run(&d, &["ZREMRANGEBYRANK", "z", "0", "1"]).await, 2);
        assert_eq!(
            sorted_members(&run(&d, &["ZRANGE", "z", "0", "-1"]).await),
            vec!["c"]
        );
    }

    #[tokio::test]
    async fn zunion_sums_scores() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z1", "1", "a", "2", "b"]).await, 2);
        assert_int(&run(&d, &["ZADD", "z2", "10", "b", "20", "c"]).await, 2);
        assert_eq!(
            pairs(&run(&d, &["ZUNION", "2", "z1", "z2", "WITHSCORES"]).await),
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "12".into()),
                ("c".into(), "20".into())
            ]
        );
        assert_int(&run(&d, &["ZUNIONSTORE", "dest", "2", "z1", "z2"]).await, 3);
    }

    #[tokio::test]
    async fn zinter_requires_membership_everywhere() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z1", "1", "a", "2", "b"]).await, 2);
        assert_int(&run(&d, &["ZADD", "z2", "10", "b", "20", "c"]).await, 2);
        assert_eq!(
            pairs(&run(&d, &["ZINTER", "2", "z1", "z2", "WITHSCORES"]).await),
            vec![("b".into(), "12".into())]
        );
        assert_int(&run(&d, &["ZINTERSTORE", "dest", "2", "z1", "z2"]).await, 1);
        assert_bulk(&run(&d, &["ZSCORE", "dest", "b"]).await, "12");
    }

    #[tokio::test]
    async fn zdiff_keeps_first_set_scores() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z1", "1", "a", "2", "b"]).await, 2);
        assert_int(&run(&d, &["ZADD", "z2", "99", "b"]).await, 1);
        assert_eq!(
            pairs(&run(&d, &["ZDIFF", "2", "z1", "z2", "WITHSCORES"]).await),
            vec![("a".into(), "1".into())]
        );
        assert_int(&run(&d, &["ZDIFFSTORE", "dest", "2", "z1", "z2"]).await, 1);
    }

    #[tokio::test]
    async fn zrandmember_shapes() {
        let d = dispatcher();
        assert_int(&run(&d, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]).await, 3);
        match run(&d, &["ZRANDMEMBER", "z"]).await {
            Frame::Bulk(_) => {}
            other => panic!("expected bulk, got {other:?}"),
        }
        match run(&d, &["ZRANDMEMBER", "z", "2"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
        match run(&d, &["ZRANDMEMBER", "z", "2", "WITHSCORES"]).await {
            Frame::Array(items) => assert_eq!(items.len(), 4),
            other => panic!("expected array, got {other:?}"),
        }
        assert_nil(&run(&d, &["ZRANDMEMBER", "missing"]).await);
    }

    #[tokio::test]
    async fn zset_commands_reject_other_types() {
        let d = dispatcher();
        assert_ok(&run(&d, &["SET", "s", "v"]).await);
        assert_error_contains(&run(&d, &["ZADD", "s", "1", "m"]).await, "WRONGTYPE");
        assert_error_contains(&run(&d, &["ZRANGE", "s", "0", "-1"]).await, "WRONGTYPE");
    }
}
