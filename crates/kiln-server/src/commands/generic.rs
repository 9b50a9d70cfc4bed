//! Generic key commands: existence, deletion, and expiry management.

use bytes::Bytes;

use kiln_core::time;
use kiln_core::KeyspaceError;
use kiln_protocol::Frame;

use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{check_arity, handler, int, key_at, keys_from, parse_int, Intent};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "DEL",
            description: "Delete one or more keys",
            categories: &[Category::Write, Category::Generic, Category::Slow],
            sync: true,
            key_extraction: kx_del,
            handler: handler!(del),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "EXISTS",
            description: "Count how many of the given keys exist",
            categories: &[Category::Read, Category::Generic, Category::Fast],
            sync: false,
            key_extraction: kx_exists,
            handler: handler!(exists),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "PERSIST",
            description: "Remove the expiry from a key",
            categories: &[Category::Write, Category::Generic, Category::Fast],
            sync: true,
            key_extraction: kx_one_write,
            handler: handler!(persist),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "EXPIRE",
            description: "Set a key's time to live in seconds",
            categories: &[Category::Write, Category::Generic, Category::Fast],
            sync: true,
            key_extraction: kx_expire,
            handler: handler!(expire),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "EXPIREAT",
            description: "Set a key's expiry as an absolute unix timestamp",
            categories: &[Category::Write, Category::Generic, Category::Fast],
            sync: true,
            key_extraction: kx_expire,
            handler: handler!(expireat),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "TTL",
            description: "Remaining time to live of a key in seconds",
            categories: &[Category::Read, Category::Generic, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(ttl),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "EXPIRETIME",
            description: "Absolute unix timestamp at which a key expires",
            categories: &[Category::Read, Category::Generic, Category::Fast],
            sync: false,
            key_extraction: kx_one_read,
            handler: handler!(expiretime),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_del(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, None, "del")?;
    Ok(AccessKeys::write(keys_from(tokens, 1)?))
}

fn kx_exists(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, None, "exists")?;
    Ok(AccessKeys::read(keys_from(tokens, 1)?))
}

fn kx_one_write(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "persist")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_expire(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "expire")?;
    Ok(AccessKeys::write(vec![key_at(tokens, 1)?]))
}

fn kx_one_read(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "ttl")?;
    Ok(AccessKeys::read(vec![key_at(tokens, 1)?]))
}

// -- handlers --

async fn del(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let keys = keys_from(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;

    let wants = keys.iter().map(|k| (k.clone(), Intent::Write)).collect();
    let guards = super::lock_keys(keyspace, wants, input.ctx).await?;

    let mut removed = 0;
    for (_, guard) in guards {
        if let Some(write) = guard.into_write() {
            if keyspace.delete(write) {
                removed += 1;
            }
        }
    }
    Ok(int(removed))
}

async fn exists(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let keys = keys_from(input.tokens, 1)?;
    let keyspace = &input.server.keyspace;

    // counted per occurrence, so repeated keys count repeatedly;
    // locks are taken one at a time, never held together
    let mut count = 0;
    for key in &keys {
        match keyspace.rlock(key, input.ctx).await {
            Ok(_guard) => count += 1,
            Err(KeyspaceError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(int(count))
}

async fn persist(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.lock(&key, input.ctx).await {
        Ok(mut guard) => {
            if guard.expiry_ms().is_some() {
                guard.remove_expiry();
                Ok(int(1))
            } else {
                Ok(int(0))
            }
        }
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn expire(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let seconds = parse_int(&input.tokens[2])?;
    let at_ms = if seconds <= 0 {
        // non-positive TTLs delete on next access
        1
    } else {
        time::now_ms().saturating_add((seconds as u64).saturating_mul(1000))
    };
    set_expiry_at(input, &key, at_ms).await
}

async fn expireat(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    let at_secs = parse_int(&input.tokens[2])?;
    let at_ms = if at_secs <= 0 {
        1
    } else {
        (at_secs as u64).saturating_mul(1000)
    };
    set_expiry_at(input, &key, at_ms).await
}

async fn set_expiry_at(
    input: HandlerInput<'_>,
    key: &str,
    at_ms: u64,
) -> Result<Frame, CommandError> {
    match input.server.keyspace.lock(key, input.ctx).await {
        Ok(mut guard) => {
            guard.set_expiry(at_ms, true);
            Ok(int(1))
        }
        Err(KeyspaceError::NotFound) => Ok(int(0)),
        Err(e) => Err(e.into()),
    }
}

async fn ttl(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => match guard.expiry_ms() {
            Some(at) => Ok(int((at.saturating_sub(time::now_ms()) / 1000) as i64)),
            None => Ok(int(-1)),
        },
        Err(KeyspaceError::NotFound) => Ok(int(-2)),
        Err(e) => Err(e.into()),
    }
}

async fn expiretime(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let key = key_at(input.tokens, 1)?;
    match input.server.keyspace.rlock(&key, input.ctx).await {
        Ok(guard) => match guard.expiry_ms() {
            Some(at) => Ok(int((at / 1000) as i64)),
            None => Ok(int(-1)),
        },
        Err(KeyspaceError::NotFound) => Ok(int(-2)),
        Err(e) => Err(e.into()),
    }
}
