//! List commands.

use bytes::Bytes;

use kiln_core::types::{normalize_range, Value};
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{
    as_list, check_arity, drop_if_empty, handler, int, key_at, list_mut, parse_count, parse_int,
    token_str, Intent, KeyGuard,
};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "LPUSH",
            description: "Push values onto the head of a list",
            categories: &[Category::Write, Category::List, Category::Fast],
            sync: true,
            key_extraction: kx_push,
            handler: handler!(lpush),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "RPUSH",
            description: "Push values onto the tail of a list",
            categories: &[Category::Write, Category::List, Category::Fast],
            sync: true,
            key_extraction: kx_push,
            handler: handler!(rpush),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LPOP",
            description: "Pop values from the head of a list",
            categories: &[Category::Write, Category::List, Category::Fast],
            sync: true,
            key_extraction: kx_pop,
            handler: handler!(lpop),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "RPOP",
            description: "Pop values from the tail of a list",
            categories: &[Category::Write, Category::List, Category::Fast],
            sync: true,
            key_extraction: kx_pop,
            handler: handler!(rpop),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LLEN",
            description: "Length of a list",
            categories: &[Category::Read, Category::List, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(llen),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LRANGE",
            description: "A range of list elements by index",
            categories: &[Category::Read, Category::List, Category::Slow],
            sync: false,
            key_extraction: kx_range_read,
            handler: handler!(lrange),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LINDEX",
            description: "The element at an index",
            categories: &[Category::Read, Category::List, Category::Slow],
            sync: false,
            key_extraction: kx_index_read,
            handler: handler!(lindex),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LSET",
            description: "Replace the element at an index",
            categories: &[Category::Write, Category::List, Category::Slow],
            sync: true,
            key_extraction: kx_lset,
            handler: handler!(lset),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LTRIM",
            description: "Trim a list to a range of indices",
            categories: &[Category::Write, Category::List, Category::Slow],
            sync: true,
            key_extraction: kx_range_write,
            handler: handler!(ltrim),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LREM",
            description: "Remove matching elements from a list",
            categories: &[Category::Write, Category::List, Category::Slow],
            sync: true,
            key_extraction: kx_lrem,
            handler: handler!(lrem),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "LMOVE",
            description: "Move an element between lists",
            categories: &[Category::Write, Category::List, Category::Slow],
            sync: true,
            key_extraction: kx_lmove,
            handler: handler!(lmove),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_push(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, None, "lpush")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_pop(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(3), "lpop")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_one_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "llen")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_range_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "lrange")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_index_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "lindex")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

fn kx_lset(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "lset")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_range_write(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "ltrim")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_lrem(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 4, Some(4), "lrem")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_lmove(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 5, Some(5), "lmove")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?, key_at(tokens, 2)?]))
}

// -- handlers --

async fn push(input: HandlerInput<'_>, front: bool) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;
    let (mut guard, created) = keyspace.create_and_lock(&key, input.ctx).await?;
    let list = list_mut(&mut guard, created)?;

    for value in &input.tokens[2..] {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    Ok(int(list.len() as i64))
}

async fn lpush(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    push(input, true).await
}

async fn rpush(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    push(input, false).await
}

async fn pop(input: HandlerInput<'_>, front: bool) -> Result<Frame, CommandError> {
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
                Some(_) => Frame::NullArray,
            })
        }
        Err(e) => return Err(e.into()),
    };

    let list = list_mut(&mut guard, false)?;
    let take = count.unwrap_or(1).min(list.len());
    let mut popped = Vec::with_capacity(take);
    for _ in 0..take {
        let elem = if front {
            list.pop_front()
        } else {
            list.pop_back()
        };
        match elem {
            Some(elem) => popped.push(elem),
            None => break,
        }
    }
    drop_if_empty(keyspace, guard);

    Ok(match count {
        None => match popped.into_iter().next() {
            Some(elem) => Frame::Bulk(elem),
            None => Frame::Null,
        },
        Some(_) => Frame::Array(popped.into_iter().map(Frame::Bulk).collect()),
    })
}

async fn lpop(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    pop(input, true).await
}

async fn rpop(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    pop(input, false).await
}

async fn llen(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => Ok(int(as_list(guard.value())?.len() as i64)),
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn lrange(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let start = parse_int(&input.tokens[2])?;
    let stop = parse_int(&input.tokens[3])?;

    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let list = as_list(guard.value())?;
            let (s, e) = normalize_range(start, stop, list.len() as i64);
            if s > e {
                return Ok(Frame::Array(Vec::new()));
            }
            Ok(Frame::Array(
                list.iter()
                    .skip(s as usize)
                    .take((e - s + 1) as usize)
                    .map(|elem| Frame::Bulk(elem.clone()))
                    .collect(),
            ))
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Array(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

async fn lindex(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let index = parse_int(&input.tokens[2])?;

    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => {
            let list = as_list(guard.value())?;
            let len = list.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                return Ok(Frame::Null);
            }
            Ok(Frame::Bulk(list[idx as usize].clone()))
        }
        Err(KeyspaceError::NotFound) => Ok(Frame::Null),
        Err(e) => Err(e.into()),
    }
}

async fn lset(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let index = parse_int(&input.tokens[2])?;
    let value = input.tokens[3].clone();

    let mut guard = match input.server.keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Err(CommandError::NotFound),
        Err(e) => return Err(e.into()),
    };

    let list = list_mut(&mut guard, false)?;
    let len = list.len() as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        return Err(CommandError::value("index out of range"));
    }
    list[idx as usize] = value;
    Ok(super::ok())
}

async fn ltrim(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let start = parse_int(&input.tokens[2])?;
    let stop = parse_int(&input.tokens[3])?;
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(super::ok()),
        Err(e) => return Err(e.into()),
    };

    let list = list_mut(&mut guard, false)?;
    let (s, e) = normalize_range(start, stop, list.len() as i64);
    if s > e {
        list.clear();
    } else {
        list.truncate((e + 1) as usize);
        for _ in 0..s {
            list.pop_front();
        }
    }
    drop_if_empty(keyspace, guard);
    Ok(super::ok())
}

async fn lrem(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let count = parse_int(&input.tokens[2])?;
    let target = &input.tokens[3];
    let keyspace = &input.server.keyspace;

    let mut guard = match keyspace.lock(&key, input.ctx).await {
        Ok(guard) => guard,
        Err(KeyspaceError::NotFound) => return Ok(int(0)),
        Err(e) => return Err(e.into()),
    };

    let list = list_mut(&mut guard, false)?;
    let limit = if count == 0 {
        usize::MAX
    } else {
        count.unsigned_abs() as usize
    };

    // count > 0 removes from the head forward, count < 0 from the tail
    // backward, count == 0 removes every match
    let indices: Vec<usize> = if count >= 0 {
        list.iter()
            .enumerate()
            .filter(|(_, elem)| *elem == target)
            .map(|(i, _)| i)
            .take(limit)
            .collect()
    } else {
        list.iter()
            .enumerate()
            .rev()
            .filter(|(_, elem)| *elem == target)
            .map(|(i, _)| i)
            .take(limit)
            .collect()
    };

    // remove back-to-front so earlier indices stay valid
    let mut sorted = indices;
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let removed = sorted.len();
    for idx in sorted {
        list.remove(idx);
    }

    drop_if_empty(keyspace, guard);
    Ok(int(removed as i64))
}

async fn lmove(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let source = key_at(input.tokens, 1)?;
    let dest = key_at(input.tokens, 2)?;
    let from_left = match token_str(&input.tokens[3])?.to_ascii_uppercase().as_str() {
        "LEFT" => true,
        "RIGHT" => false,
        _ => return Err(CommandError::value("syntax error")),
    };
    let to_left = match token_str(&input.tokens[4])?.to_ascii_uppercase().as_str() {
        "LEFT" => true,
        "RIGHT" => false,
        _ => return Err(CommandError::value("syntax error")),
    };
    let keyspace = &input.server.keyspace;

    if source == dest {
        // rotate within one list
        let mut guard = match keyspace.lock(&source, input.ctx).await {
            Ok(guard) => guard,
            Err(KeyspaceError::NotFound) => return Ok(Frame::Null),
            Err(e) => return Err(e.into()),
        };
        let list = list_mut(&mut guard, false)?;
        let Some(elem) = (if from_left {
            list.pop_front()
        } else {
            list.pop_back()
        }) else {
            return Ok(Frame::Null);
        };
        if to_left {
            list.push_front(elem.clone());
        } else {
            list.push_back(elem.clone());
        }
        return Ok(Frame::Bulk(elem));
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
        if let Some((dest_guard, created)) = guards
            .remove(&dest)
            .and_then(KeyGuard::into_write_with_created)
        {
            if created {
                keyspace.delete(dest_guard);
            }
        }
        return Ok(Frame::Null);
    };

    let src_list = list_mut(&mut src_guard, false)?;
    let elem = if from_left {
        src_list.pop_front()
    } else {
        src_list.pop_back()
    };

    let Some((mut dest_guard, dest_created)) = guards
        .remove(&dest)
        .and_then(KeyGuard::into_write_with_created)
    else {
        return Err(CommandError::value("destination key lock was lost"));
    };

    match elem {
        Some(elem) => {
            let dest_list = list_mut(&mut dest_guard, dest_created)?;
            if to_left {
                dest_list.push_front(elem.clone());
            } else {
                dest_list.push_back(elem.clone());
            }
            drop_if_empty(keyspace, src_guard);
            Ok(Frame::Bulk(elem))
        }
        None => {
            if dest_created {
                keyspace.delete(dest_guard);
            }
            Ok(Frame::Null)
        }
    }
}
