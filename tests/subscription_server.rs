mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{complete, subscribe, FakeConnection, Harness, SendTracker};
use subbus::server::{ClientLifecycle, ConnectionState, ServerOptions};
use subbus::{
    EventReceiver, SecurityContext, StaticSchema, SubProtocol, SubscriptionError, SubscriptionEvent,
    SubscriptionEventName, SubscriptionRoute,
};

fn ship_updated() -> SubscriptionEvent {
    SubscriptionEvent::new("S", "shipUpdated", json!({"name": "Rocinante"}))
}

fn event_name(event: &str) -> SubscriptionEventName {
    SubscriptionEventName::new("S", event)
}

#[tokio::test]
async fn fans_out_only_to_clients_on_the_route() {
    let harness = Harness::standard();
    let first = FakeConnection::transport();
    let second = FakeConnection::transport();
    let unrelated = FakeConnection::transport();

    for connection in [&first, &second] {
        let client = harness.connect(connection).await;
        client
            .handle_text(&subscribe("1", "subscription { shipUpdated { name } }"))
            .await
            .unwrap();
    }
    let client = harness.connect(&unrelated).await;
    client
        .handle_text(&subscribe("1", "subscription { fleetChanged { name } }"))
        .await
        .unwrap();

    assert_eq!(harness.publish(ship_updated()).await, 1);

    for connection in [&first, &second] {
        let next = connection.messages_of_type("next");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0]["id"], "1");
        assert_eq!(next[0]["payload"]["data"]["shipUpdated"]["name"], "Rocinante");
    }
    assert!(unrelated.messages_of_type("next").is_empty());
    assert_eq!(harness.queue.stats().delivered, 1);
}

#[tokio::test]
async fn fan_out_reports_notified_clients() {
    let harness = Harness::standard();
    for _ in 0..3 {
        let connection = FakeConnection::transport();
        let client = harness.connect(&connection).await;
        client
            .handle_text(&subscribe("s", "subscription { shipUpdated }"))
            .await
            .unwrap();
    }

    let notified = harness.server.receive_event(Arc::new(ship_updated())).await.unwrap();
    assert_eq!(notified, 3);
}

#[tokio::test]
async fn events_without_a_route_notify_nobody() {
    let harness = Harness::standard();
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    client
        .handle_text(&subscribe("1", "subscription { shipUpdated }"))
        .await
        .unwrap();

    let event = Arc::new(SubscriptionEvent::new("S", "somethingElse", json!(1)));
    assert_eq!(harness.server.receive_event(event).await.unwrap(), 0);
    let event = Arc::new(SubscriptionEvent::new("OtherSchema", "shipUpdated", json!(1)));
    assert_eq!(harness.server.receive_event(event).await.unwrap(), 0);
    assert!(connection.messages_of_type("next").is_empty());
}

#[tokio::test]
async fn duplicate_route_registration_delivers_once() {
    let harness = Harness::standard();
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    client
        .handle_text(&subscribe("1", "subscription { shipUpdated }"))
        .await
        .unwrap();

    let route = SubscriptionRoute::new("shipUpdated");
    harness.server.route_added(&client, &route);
    harness.server.route_added(&client, &route);
    assert_eq!(harness.server.subscribed_client_count(&event_name("shipUpdated")), 1);

    harness.publish(ship_updated()).await;
    assert_eq!(connection.messages_of_type("next").len(), 1);
}

#[tokio::test]
async fn last_unsubscribe_unregisters_from_the_router() {
    let harness = Harness::standard();
    let first = FakeConnection::transport();
    let second = FakeConnection::transport();
    let a = harness.connect(&first).await;
    let b = harness.connect(&second).await;
    a.handle_text(&subscribe("1", "subscription { shipUpdated }")).await.unwrap();
    b.handle_text(&subscribe("1", "subscription { shipUpdated }")).await.unwrap();

    assert_eq!(harness.router.receiver_count(&event_name("shipUpdated")), 1);

    a.handle_text(&complete("1")).await.unwrap();
    assert_eq!(harness.router.receiver_count(&event_name("shipUpdated")), 1);

    b.handle_text(&complete("1")).await.unwrap();
    assert_eq!(harness.router.receiver_count(&event_name("shipUpdated")), 0);
    assert_eq!(harness.publish(ship_updated()).await, 0);
    assert_eq!(harness.queue.stats().enqueued, 0);
}

#[tokio::test]
async fn multi_event_routes_register_every_name() {
    let harness = Harness::standard();
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    client
        .handle_text(&subscribe("f", "subscription { fleetChanged }"))
        .await
        .unwrap();

    assert_eq!(harness.router.receiver_count(&event_name("shipAdded")), 1);
    assert_eq!(harness.router.receiver_count(&event_name("shipRemoved")), 1);

    harness
        .publish(SubscriptionEvent::new("S", "shipRemoved", json!({"name": "Canterbury"})))
        .await;
    let next = connection.messages_of_type("next");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0]["payload"]["data"]["fleetChanged"]["name"], "Canterbury");

    client.dispose();
    assert!(harness.router.registered_names().is_empty());
}

#[tokio::test]
async fn unauthenticated_connections_are_refused() {
    let harness = Harness::new(ServerOptions {
        authenticated_requests_only: true,
        ..ServerOptions::default()
    });
    let connection = FakeConnection::transport();

    let result = harness.server.register_new_client(connection.clone()).await;

    assert!(matches!(result, Err(SubscriptionError::Unauthorized(_))));
    assert_eq!(connection.messages().len(), 1);
    assert_eq!(connection.messages()[0]["type"], "error");
    assert_eq!(connection.closes().len(), 1);
    assert!(connection.closes()[0].is_protocol_error());
    assert_eq!(harness.server.client_count(), 0);
}

#[tokio::test]
async fn unauthenticated_legacy_connections_get_connection_error() {
    let harness = Harness::new(ServerOptions {
        authenticated_requests_only: true,
        ..ServerOptions::default()
    });
    let connection = FakeConnection::legacy();

    assert!(harness.server.register_new_client(connection.clone()).await.is_err());
    assert_eq!(connection.messages_of_type("connection_error").len(), 1);
    assert_eq!(connection.closes().len(), 1);
}

#[tokio::test]
async fn authenticated_connections_are_accepted() {
    let harness = Harness::new(ServerOptions {
        authenticated_requests_only: true,
        ..ServerOptions::default()
    });
    let connection = FakeConnection::new(SubProtocol::GraphqlTransportWs, SecurityContext::authenticated("naomi"));

    let client = harness.connect(&connection).await;
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(connection.messages_of_type("connection_ack").len(), 1);
    assert!(connection.closes().is_empty());
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let harness = Harness::new(ServerOptions {
        max_connected_clients: Some(1),
        ..ServerOptions::default()
    });
    let first = FakeConnection::transport();
    let second = FakeConnection::transport();

    let client = harness.connect(&first).await;
    assert!(harness.server.register_new_client(second.clone()).await.is_err());
    assert_eq!(second.closes()[0].code, 1013);

    client.close(subbus::CloseStatus::normal()).await;
    assert_eq!(harness.server.client_count(), 0);
    assert!(harness.server.register_new_client(FakeConnection::transport()).await.is_ok());
}

#[tokio::test]
async fn failed_delivery_does_not_stop_other_clients() {
    let harness = Harness::standard();
    let broken = FakeConnection::transport();
    let healthy = FakeConnection::transport();
    for connection in [&broken, &healthy] {
        let client = harness.connect(connection).await;
        client
            .handle_text(&subscribe("1", "subscription { shipUpdated }"))
            .await
            .unwrap();
    }
    broken.fail_sends();

    let result = harness.server.receive_event(Arc::new(ship_updated())).await;

    assert!(matches!(result, Err(SubscriptionError::Send(_))));
    assert_eq!(healthy.messages_of_type("next").len(), 1);
}

#[tokio::test]
async fn queue_records_fan_out_failures() {
    let harness = Harness::standard();
    let broken = FakeConnection::transport();
    let client = harness.connect(&broken).await;
    client
        .handle_text(&subscribe("1", "subscription { shipUpdated }"))
        .await
        .unwrap();
    broken.fail_sends();

    harness.publish(ship_updated()).await;
    assert_eq!(harness.queue.stats().failed, 1);
}

#[tokio::test]
async fn dispose_is_idempotent_and_stops_listening() {
    let harness = Harness::standard();
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    client
        .handle_text(&subscribe("1", "subscription { shipUpdated }"))
        .await
        .unwrap();

    harness.server.dispose();
    harness.server.dispose();

    assert!(harness.server.is_disposed());
    assert!(harness.router.registered_names().is_empty());
    assert_eq!(harness.server.receive_event(Arc::new(ship_updated())).await.unwrap(), 0);
    assert!(harness.server.register_new_client(FakeConnection::transport()).await.is_err());
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let harness = Harness::standard();
    let first = FakeConnection::transport();
    let second = FakeConnection::legacy();
    harness.connect(&first).await;
    harness.connect(&second).await;

    harness.server.shutdown().await;

    assert_eq!(first.closes()[0].code, 1001);
    assert_eq!(second.closes()[0].code, 1001);
    assert_eq!(harness.server.client_count(), 0);
}

fn watched_schema() -> StaticSchema {
    StaticSchema::from_definition("S", "shipUpdated; shipWatch=shipUpdated").unwrap()
}

#[tokio::test]
async fn one_event_reaches_every_route_it_feeds() {
    let harness = Harness::with_schema(watched_schema(), ServerOptions::default());
    let updates = FakeConnection::transport();
    let watches = FakeConnection::transport();
    harness
        .connect(&updates)
        .await
        .handle_text(&subscribe("1", "subscription { shipUpdated { name } }"))
        .await
        .unwrap();
    harness
        .connect(&watches)
        .await
        .handle_text(&subscribe("1", "subscription { shipWatch { name } }"))
        .await
        .unwrap();

    harness.publish(ship_updated()).await;

    let next = updates.messages_of_type("next");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0]["payload"]["data"]["shipUpdated"]["name"], "Rocinante");
    let next = watches.messages_of_type("next");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0]["payload"]["data"]["shipWatch"]["name"], "Rocinante");
}

#[tokio::test]
async fn client_keeps_listening_while_another_route_needs_the_name() {
    let harness = Harness::with_schema(watched_schema(), ServerOptions::default());
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    client.handle_text(&subscribe("1", "subscription { shipUpdated }")).await.unwrap();
    client.handle_text(&subscribe("2", "subscription { shipWatch }")).await.unwrap();
    let name = event_name("shipUpdated");

    harness.publish(ship_updated()).await;
    assert_eq!(connection.messages_of_type("next").len(), 2);

    client.handle_text(&complete("1")).await.unwrap();
    assert_eq!(harness.server.subscribed_client_count(&name), 1);
    assert_eq!(harness.router.receiver_count(&name), 1);

    harness.publish(ship_updated()).await;
    let next = connection.messages_of_type("next");
    assert_eq!(next.len(), 3);
    assert_eq!(next[2]["id"], "2");

    client.handle_text(&complete("2")).await.unwrap();
    assert_eq!(harness.server.subscribed_client_count(&name), 0);
    assert_eq!(harness.router.receiver_count(&name), 0);
}

#[tokio::test]
async fn concurrent_notifications_are_bounded() {
    let harness = Harness::new(ServerOptions {
        max_concurrent_client_notifications: 2,
        ..ServerOptions::default()
    });
    let tracker = Arc::new(SendTracker::default());
    let mut connections = Vec::new();
    for _ in 0..6 {
        let connection = FakeConnection::slow(tracker.clone(), Duration::from_millis(20));
        let client = harness.connect(&connection).await;
        client
            .handle_text(&subscribe("1", "subscription { shipUpdated }"))
            .await
            .unwrap();
        connections.push(connection);
    }
    tracker.reset();

    let notified = harness.server.receive_event(Arc::new(ship_updated())).await.unwrap();

    assert_eq!(notified, 6);
    assert_eq!(tracker.peak(), 2);
    for connection in &connections {
        assert_eq!(connection.messages_of_type("next").len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribe_and_completion_keep_bookkeeping_consistent() {
    let harness = Harness::standard();
    let connection = FakeConnection::transport();
    let client = harness.connect(&connection).await;
    let name = event_name("shipUpdated");

    for round in 0..50 {
        let subscriber = client.clone();
        let subscribing = tokio::spawn(async move {
            subscriber
                .handle_text(&subscribe(&format!("s{}", round), "subscription { shipUpdated }"))
                .await
        });
        let server = harness.server.clone();
        let completing =
            tokio::spawn(async move { server.receive_event(Arc::new(ship_updated().completing())).await });
        subscribing.await.unwrap().unwrap();
        completing.await.unwrap().unwrap();

        let listening = harness.server.subscribed_client_count(&name) == 1;
        assert_eq!(listening, client.subscription_count() > 0, "round {}", round);
        assert_eq!(harness.router.receiver_count(&name), usize::from(listening), "round {}", round);
    }
}
