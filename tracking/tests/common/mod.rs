#![allow(dead_code)]
use std::{str::FromStr, time::Duration};

use courier::prelude::*;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::filter::EnvFilter::from_default_env()
                    .add_directive(tracing_subscriber::filter::Directive::from_str("info").unwrap())
                    .add_directive(
                        tracing_subscriber::filter::Directive::from_str("courier=debug").unwrap(),
                    ),
            ),
        )
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub number: u32,
}

impl MessageAttribute for Command {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("Command");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub number: u32,
}

impl MessageAttribute for Query {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("Query");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub number: u32,
}

impl MessageAttribute for QueryResult {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("Result");
}

#[derive(Debug)]
pub struct Rejected;

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("rejected")
    }
}

impl std::error::Error for Rejected {}

pub fn config(bus: &LocalBus, index: u64, service_name: &str) -> RuntimeConfig {
    RuntimeConfig {
        local_scheduler_tick: Duration::from_millis(10),
        ..RuntimeConfig::new(NodeId::new_indexed(index), service_name)
    }
    .with_transport(TransportService::new(bus.transport()))
    .with_poll_interval(Duration::from_millis(20))
    .with_retry(RetryPolicy::new(2, Duration::from_millis(20)))
}

/// A "Sender" node and a "Receiver" node answering `Command` and `Query`.
pub async fn sender_and_receiver(bus: &LocalBus) -> courier::Result<(Runtime, Runtime)> {
    let sender = Runtime::new(config(bus, 1, "Sender"), HandlerTable::builder());
    let receiver = Runtime::new(
        config(bus, 2, "Receiver"),
        HandlerTable::builder()
            .with_handler(|Json(command): Json<Command>| async move {
                if command.number == 0 {
                    Err(Rejected)
                } else {
                    Ok(())
                }
            })
            .with_handler(|Json(query): Json<Query>| async move {
                Ok::<_, Rejected>(Json(QueryResult {
                    number: query.number,
                }))
            }),
    );
    sender.start().await?;
    receiver.start().await?;
    Ok((sender, receiver))
}
