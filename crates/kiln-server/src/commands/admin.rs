//! Connection and administration commands.

use bytes::Bytes;

use kiln_protocol::Frame;

use crate::dispatch::{run_aof_rewrite, run_snapshot};
use crate::error::CommandError;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput, SubCommandSpec};

use super::{check_arity, handler, int, ok};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "PING",
            description: "Ping the server, optionally echoing a message",
            categories: &[Category::Connection, Category::Fast],
            sync: false,
            key_extraction: kx_ping,
            handler: handler!(ping),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "ECHO",
            description: "Echo the given message",
            categories: &[Category::Connection, Category::Fast],
            sync: false,
            key_extraction: kx_echo,
            handler: handler!(echo),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "AUTH",
            description: "Authenticate the connection",
            categories: &[Category::Connection, Category::Fast],
            sync: false,
            key_extraction: kx_auth,
            handler: handler!(auth),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "COMMAND",
            description: "Describe the command table",
            categories: &[Category::Admin, Category::Slow],
            sync: false,
            key_extraction: kx_none,
            handler: handler!(command_table),
            subcommands: vec![
                SubCommandSpec {
                    name: "COUNT",
                    description: "Number of registered commands",
                    categories: &[Category::Admin, Category::Slow],
                    sync: false,
                    key_extraction: kx_none,
                    handler: handler!(command_count),
                },
                SubCommandSpec {
                    name: "LIST",
                    description: "Names of every registered command",
                    categories: &[Category::Admin, Category::Slow],
                    sync: false,
                    key_extraction: kx_none,
                    handler: handler!(command_list),
                },
            ],
        },
        CommandSpec {
            name: "SAVE",
            description: "Write a snapshot of the keyspace synchronously",
            categories: &[Category::Admin, Category::Slow],
            sync: false,
            key_extraction: kx_none,
            handler: handler!(save),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "BGSAVE",
            description: "Write a snapshot of the keyspace in the background",
            categories: &[Category::Admin, Category::Slow],
            sync: false,
            key_extraction: kx_none,
            handler: handler!(bgsave),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "BGREWRITEAOF",
            description: "Rewrite the append-only file in the background",
            categories: &[Category::Admin, Category::Slow],
            sync: false,
            key_extraction: kx_none,
            handler: handler!(bgrewriteaof),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_ping(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 1, Some(2), "ping")?;
    Ok(AccessKeys::none())
}

fn kx_echo(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(2), "echo")?;
    Ok(AccessKeys::none())
}

fn kx_auth(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, Some(3), "auth")?;
    Ok(AccessKeys::none())
}

fn kx_none(_tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    Ok(AccessKeys::none())
}

// -- handlers --

async fn ping(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    Ok(match input.tokens.get(1) {
        Some(msg) => Frame::Bulk(msg.clone()),
        None => Frame::Simple("PONG".into()),
    })
}

async fn echo(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    Ok(Frame::Bulk(input.tokens[1].clone()))
}

async fn auth(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let conn = input
        .conn
        .ok_or_else(|| CommandError::value("AUTH requires a client connection"))?;
    input.server.acl.authenticate(conn.id, &input.tokens[1..])?;
    Ok(ok())
}

/// COMMAND with no subcommand: one entry per command, carrying name,
/// category tags, and description.
async fn command_table(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let entries = input
        .server
        .registry
        .iter()
        .map(|spec| {
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(spec.name.as_bytes())),
                Frame::Array(
                    spec.categories
                        .iter()
                        .map(|c| Frame::Bulk(Bytes::from_static(c.as_str().as_bytes())))
                        .collect(),
                ),
                Frame::Bulk(Bytes::from_static(spec.description.as_bytes())),
            ])
        })
        .collect();
    Ok(Frame::Array(entries))
}

async fn command_count(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    Ok(int(input.server.registry.len() as i64))
}

async fn command_list(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    Ok(Frame::Array(
        input
            .server
            .registry
            .iter()
            .map(|spec| Frame::Bulk(Bytes::from_static(spec.name.as_bytes())))
            .collect(),
    ))
}

async fn save(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    run_snapshot(input.server.as_ref()).await?;
    Ok(ok())
}

async fn bgsave(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    if input.server.snapshots.is_none() {
        return Err(CommandError::value("snapshots are disabled"));
    }
    let state = std::sync::Arc::clone(input.server);
    tokio::spawn(async move {
        if let Err(e) = run_snapshot(&state).await {
            tracing::warn!("background snapshot failed: {e}");
        }
    });
    Ok(Frame::Simple("Background saving started".into()))
}

async fn bgrewriteaof(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    if input.server.aof.is_none() {
        return Err(CommandError::value("the append-only file is disabled"));
    }
    let state = std::sync::Arc::clone(input.server);
    tokio::spawn(async move {
        if let Err(e) = run_aof_rewrite(&state).await {
            tracing::warn!("background aof rewrite failed: {e}");
        }
    });
    Ok(Frame::Simple(
        "Background append only file rewriting started".into(),
    ))
}
