mod common;
use std::time::Duration;

use common::*;
use courier::prelude::*;

#[tokio::test]
async fn test_fire_and_forget() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let handled = Counter::default();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    let receiver = Runtime::new(
        test_config(&bus, 2, "Receiver"),
        HandlerTable::builder().with_handler({
            let handled = handled.clone();
            move |Json(command): Json<Command>| {
                let handled = handled.clone();
                async move {
                    assert_eq!(command.value, 10);
                    handled.incr();
                    Ok::<_, TestFailure>(())
                }
            }
        }),
    );
    sender.start().await?;
    receiver.start().await?;
    sender
        .send_message(Json(Command { value: 10 }), receiver.control_address())
        .await?;
    assert!(eventually(Duration::from_secs(2), || async { handled.get() == 1 }).await);
    // the outbox row is gone once the frame left
    let store = sender.durable().clone();
    assert!(eventually(Duration::from_secs(1), || async { memory(&store).len(QueueKind::Outgoing).await == 0 }).await);
    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_request_reply() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    let receiver = Runtime::new(
        test_config(&bus, 2, "Receiver"),
        HandlerTable::builder().with_handler(|Json(query): Json<Query>| async move {
            Ok::<_, TestFailure>(Json(QueryResult { value: query.value }))
        }),
    );
    sender.start().await?;
    receiver.start().await?;
    let Json(result): Json<QueryResult> = sender
        .invoke(Json(Query { value: 13 }), receiver.control_address())
        .await?;
    assert_eq!(result.value, 13);
    assert_eq!(sender.pending_replies(), 0);

    // replies also correlate on an explicit correlation id
    let correlation_id = EnvelopeId::new_snowflake();
    let request = Json(Query { value: 7 })
        .into_envelope(receiver.control_address())
        .map_err(courier::Error::contextual("encode"))?;
    let request = Envelope {
        correlation_id: Some(correlation_id),
        ..request
    };
    let reply = sender
        .send_and_await(request, Duration::from_secs(2))
        .await?;
    assert_eq!(reply.correlation_id, Some(correlation_id));
    assert_eq!(reply.message_type, QueryResult::MESSAGE_TYPE);
    assert_eq!(reply.source, Some(receiver.id()));
    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_reply_timeout() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    // answers nothing, the query completes without a reply
    let receiver = Runtime::new(test_config(&bus, 2, "Receiver"), HandlerTable::builder());
    sender.start().await?;
    receiver.start().await?;
    let error = sender
        .invoke_with_timeout::<_, Json<QueryResult>>(
            Json(Query { value: 1 }),
            receiver.control_address(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(error.kind, ErrorKind::ReplyTimeout));
    assert_eq!(sender.pending_replies(), 0);
    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_correlation_rejected() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    let receiver = Runtime::new(test_config(&bus, 2, "Receiver"), HandlerTable::builder());
    sender.start().await?;
    receiver.start().await?;
    let correlation_id = EnvelopeId::new_snowflake();
    let request = |value| {
        let envelope = Json(Query { value })
            .into_envelope(receiver.control_address())
            .unwrap();
        Envelope {
            correlation_id: Some(correlation_id),
            ..envelope
        }
    };
    let first = {
        let sender = sender.clone();
        let request = request(1);
        tokio::spawn(async move { sender.send_and_await(request, Duration::from_millis(300)).await })
    };
    assert!(eventually(Duration::from_secs(1), || async { sender.pending_replies() == 1 }).await);
    let error = sender
        .send_and_await(request(2), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(error.kind, ErrorKind::DuplicateCorrelation(id) if id == correlation_id));
    assert!(matches!(
        first.await.unwrap().unwrap_err().kind,
        ErrorKind::ReplyTimeout
    ));
    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_destination() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    sender.start().await?;
    let destination: Address = "tcp://127.0.0.1:9559".parse().unwrap();
    let error = sender
        .send_message(Json(Command { value: 1 }), destination)
        .await
        .unwrap_err();
    assert!(matches!(error.kind, ErrorKind::UnknownDestination(_)));
    sender.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_endpoint_address() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let handled = Counter::default();
    let orders: Address = "local://orders".parse().unwrap();
    let sender = Runtime::new(test_config(&bus, 1, "Sender"), HandlerTable::builder());
    let receiver = Runtime::new(
        test_config(&bus, 2, "Receiver").listen_on(orders.clone()),
        HandlerTable::builder().with_handler({
            let handled = handled.clone();
            move |_: Json<Command>| {
                let handled = handled.clone();
                async move {
                    handled.incr();
                    Ok::<_, TestFailure>(())
                }
            }
        }),
    );
    sender.start().await?;
    receiver.start().await?;
    sender.send_message(Json(Command { value: 3 }), orders).await?;
    assert!(eventually(Duration::from_secs(2), || async { handled.get() == 1 }).await);
    sender.stop().await?;
    receiver.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_ping_and_work_assignment() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let coordinator = Runtime::new(test_config(&bus, 1, "Coordinator"), HandlerTable::builder());
    let worker = Runtime::new(test_config(&bus, 2, "Worker"), HandlerTable::builder());
    coordinator.start().await?;
    worker.start().await?;
    let round_trip = coordinator.ping(worker.id(), Duration::from_secs(2)).await?;
    assert!(round_trip < Duration::from_secs(2));

    coordinator.assign_work(worker.id(), "orders-42").await?;
    coordinator.assign_work(worker.id(), "orders-43").await?;
    assert!(eventually(Duration::from_secs(2), || async { worker.assignments().len() == 2 }).await);
    coordinator.release_work(worker.id(), "orders-42").await?;
    assert!(
        eventually(Duration::from_secs(2), || async {
            worker.assignments() == vec![String::from("orders-43")]
        })
        .await
    );
    assert!(coordinator.assignments().is_empty());
    coordinator.stop().await?;
    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_heartbeats_between_peers() -> courier::Result<()> {
    init_tracing();
    let bus = LocalBus::new();
    let store = memory_store();
    let config = |index, name| {
        test_config(&bus, index, name)
            .with_durable(store.clone())
            .with_heartbeat_interval(Duration::from_millis(20))
    };
    let a = Runtime::new(config(1, "A"), HandlerTable::builder());
    let b = Runtime::new(config(2, "B"), HandlerTable::builder());
    a.start().await?;
    b.start().await?;
    let nodes = store.nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    let registered_at = nodes.iter().map(|n| n.last_heartbeat).max().unwrap();
    assert!(
        eventually(Duration::from_secs(2), || async {
            let nodes = store.nodes().await.unwrap();
            nodes.iter().all(|n| n.last_heartbeat > registered_at)
        })
        .await
    );
    a.stop().await?;
    let nodes = store.nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_id, b.id());
    b.stop().await?;
    assert!(store.nodes().await.unwrap().is_empty());
    Ok(())
}
