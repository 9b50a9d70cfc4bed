//! Pub/sub commands.
//!
//! Subscriptions are per-connection: each SUBSCRIBE spawns a forwarder
//! task that relays broker messages into the connection's push
//! channel, where the read loop interleaves them with replies.

use bytes::Bytes;

use kiln_protocol::Frame;

use crate::connection::{message_frame, ConnHandle};
use crate::error::CommandError;
use crate::pubsub::PubSubManager;
use crate::registry::{AccessKeys, Category, CommandSpec, HandlerInput};

use super::{check_arity, handler, int, keys_from, token_str};

pub fn specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "SUBSCRIBE",
            description: "Subscribe to one or more channels",
            categories: &[Category::Pubsub, Category::Connection, Category::Slow],
            sync: false,
            key_extraction: kx_channels,
            handler: handler!(subscribe),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "UNSUBSCRIBE",
            description: "Unsubscribe from channels (all when none given)",
            categories: &[Category::Pubsub, Category::Connection, Category::Slow],
            sync: false,
            key_extraction: kx_channels_optional,
            handler: handler!(unsubscribe),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "PSUBSCRIBE",
            description: "Subscribe to one or more channel patterns",
            categories: &[Category::Pubsub, Category::Connection, Category::Slow],
            sync: false,
            key_extraction: kx_channels,
            handler: handler!(psubscribe),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "PUNSUBSCRIBE",
            description: "Unsubscribe from patterns (all when none given)",
            categories: &[Category::Pubsub, Category::Connection, Category::Slow],
            sync: false,
            key_extraction: kx_channels_optional,
            handler: handler!(punsubscribe),
            subcommands: Vec::new(),
        },
        CommandSpec {
            name: "PUBLISH",
            description: "Publish a message to a channel",
            categories: &[Category::Pubsub, Category::Fast],
            sync: false,
            key_extraction: kx_publish,
            handler: handler!(publish),
            subcommands: Vec::new(),
        },
    ]
}

// -- key extraction --

fn kx_channels(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 2, None, "subscribe")?;
    Ok(AccessKeys::channels(keys_from(tokens, 1)?))
}

fn kx_channels_optional(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    Ok(AccessKeys::channels(keys_from(tokens, 1)?))
}

fn kx_publish(tokens: &[Bytes]) -> Result<AccessKeys, CommandError> {
    check_arity(tokens, 3, Some(3), "publish")?;
    Ok(AccessKeys::channels(vec![token_str(&tokens[1])?.to_owned()]))
}

// -- handlers --

fn require_conn<'a>(input: &'a HandlerInput<'_>) -> Result<&'a ConnHandle, CommandError> {
    input
        .conn
        .ok_or_else(|| CommandError::value("subscriptions require a client connection"))
}

fn confirmation(kind: &'static str, name: &str, count: usize) -> Frame {
    Frame::Array(vec![
        Frame::Bulk(Bytes::from_static(kind.as_bytes())),
        Frame::Bulk(Bytes::copy_from_slice(name.as_bytes())),
        Frame::Integer(count as i64),
    ])
}

/// Spawns the relay task for one subscription's broadcast receiver.
fn spawn_forwarder(
    mut rx: tokio::sync::broadcast::Receiver<crate::pubsub::PubMessage>,
    push: tokio::sync::mpsc::UnboundedSender<Frame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if push.send(message_frame(&msg)).is_err() {
                        // connection is gone
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // slow consumer: skip the missed messages and go on
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn subscribe(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let conn = require_conn(&input)?;
    let pubsub: &PubSubManager = &input.server.pubsub;
    let channels = keys_from(input.tokens, 1)?;

    let mut confirmations = Vec::with_capacity(channels.len());
    for channel in channels {
        let rx = pubsub.subscribe(&channel);
        let task = spawn_forwarder(rx, conn.push_sender());
        conn.track_channel(channel.clone(), task);
        confirmations.push(confirmation("subscribe", &channel, conn.subscription_count()));
    }
    Ok(Frame::Array(confirmations))
}

async fn unsubscribe(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let conn = require_conn(&input)?;
    let pubsub: &PubSubManager = &input.server.pubsub;

    let channels = if input.tokens.len() > 1 {
        keys_from(input.tokens, 1)?
    } else {
        conn.channel_names()
    };

    let mut confirmations = Vec::with_capacity(channels.len());
    for channel in channels {
        if conn.drop_channel(&channel) {
            pubsub.unsubscribe(&channel);
        }
        confirmations.push(confirmation(
            "unsubscribe",
            &channel,
            conn.subscription_count(),
        ));
    }
    Ok(Frame::Array(confirmations))
}

async fn psubscribe(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let conn = require_conn(&input)?;
    let pubsub: &PubSubManager = &input.server.pubsub;
    let patterns = keys_from(input.tokens, 1)?;

    let mut confirmations = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let rx = pubsub
            .psubscribe(&pattern)
            .ok_or_else(|| CommandError::value("pattern exceeds the maximum length"))?;
        let task = spawn_forwarder(rx, conn.push_sender());
        conn.track_pattern(pattern.clone(), task);
        confirmations.push(confirmation(
            "psubscribe",
            &pattern,
            conn.subscription_count(),
        ));
    }
    Ok(Frame::Array(confirmations))
}

async fn punsubscribe(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let conn = require_conn(&input)?;
    let pubsub: &PubSubManager = &input.server.pubsub;

    let patterns = if input.tokens.len() > 1 {
        keys_from(input.tokens, 1)?
    } else {
        conn.pattern_names()
    };

    let mut confirmations = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        if conn.drop_pattern(&pattern) {
            pubsub.punsubscribe(&pattern);
        }
        confirmations.push(confirmation(
            "punsubscribe",
            &pattern,
            conn.subscription_count(),
        ));
    }
    Ok(Frame::Array(confirmations))
}

async fn publish(input: HandlerInput<'_>) -> Result<Frame, CommandError> {
    let channel = token_str(&input.tokens[1])?;
    let receivers = input
        .server
        .pubsub
        .publish(channel, input.tokens[2].clone());
    Ok(int(receivers as i64))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::connection::ConnHandle;
    use crate::dispatch::DispatchMode;
    use kiln_protocol::Frame;

    #[tokio::test]
    async fn subscribe_receives_published_messages() {
        let d = dispatcher();
        let (conn, mut push_rx) = ConnHandle::new();

        let reply = d
            .dispatch(&tokens(&["SUBSCRIBE", "news"]), DispatchMode::Client, Some(&conn))
            .await;
        match reply {
            Frame::Array(confirmations) => assert_eq!(confirmations.len(), 1),
            other => panic!("expected array, got {other:?}"),
        }

        assert_int(&run(&d, &["PUBLISH", "news", "hello"]).await, 1);

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), push_rx.recv())
            .await
            .expect("push should arrive")
            .expect("channel open");
        match pushed {
            Frame::Array(items) => {
                assert_bulk(&items[0], "message");
                assert_bulk(&items[1], "news");
                assert_bulk(&items[2], "hello");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pattern_subscription_receives_pmessage() {
        let d = dispatcher();
        let (conn, mut push_rx) = ConnHandle::new();

        d.dispatch(
            &tokens(&["PSUBSCRIBE", "news.*"]),
            DispatchMode::Client,
            Some(&conn),
        )
        .await;
        assert_int(&run(&d, &["PUBLISH", "news.sports", "goal"]).await, 1);

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), push_rx.recv())
            .await
            .expect("push should arrive")
            .expect("channel open");
        match pushed {
            Frame::Array(items) => {
                assert_bulk(&items[0], "pmessage");
                assert_bulk(&items[1], "news.*");
                assert_bulk(&items[2], "news.sports");
                assert_bulk(&items[3], "goal");
            }
            other => panic!("expected pmessage frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_counting() {
        let d = dispatcher();
        let (conn, _push_rx) = ConnHandle::new();

        d.dispatch(
            &tokens(&["SUBSCRIBE", "a", "b"]),
            DispatchMode::Client,
            Some(&conn),
        )
        .await;
        assert_eq!(conn.subscription_count(), 2);

        d.dispatch(
            &tokens(&["UNSUBSCRIBE", "a"]),
            DispatchMode::Client,
            Some(&conn),
        )
        .await;
        assert_eq!(conn.subscription_count(), 1);

        // bare UNSUBSCRIBE drops the rest
        d.dispatch(&tokens(&["UNSUBSCRIBE"]), DispatchMode::Client, Some(&conn))
            .await;
        assert_eq!(conn.subscription_count(), 0);

        assert_int(&run(&d, &["PUBLISH", "a", "x"]).await, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_zero() {
        let d = dispatcher();
        assert_int(&run(&d, &["PUBLISH", "void", "x"]).await, 0);
    }

    #[tokio::test]
    async fn subscribe_without_connection_errors() {
        let d = dispatcher();
        assert_error_contains(
            &run(&d, &["SUBSCRIBE", "ch"]).await,
            "require a client connection",
        );
    }
}
