//! Integration tests for request-response exchanges over the in-memory
//! broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use canopy_mqtt::{ClientEvent, MqttClient, QoS, TopicFilter};
use canopy_mqtt_memory::MemoryBroker;
use canopy_request_response::{
    DisconnectPolicy, Error, RequestOptions, RequestResponseClient, ResponsePath,
    SubscriptionCategory,
};
use futures::StreamExt;

fn filter(s: &str) -> TopicFilter {
    TopicFilter::new(s).unwrap()
}

/// Options for a shadow-get style exchange: publish on `svc/get`, listen
/// on the accepted/rejected pair, correlate on `clientToken`.
fn shadow_get_options(token: &str) -> RequestOptions {
    let mut options = RequestOptions::new(
        "svc/get",
        Bytes::from(format!(r#"{{"clientToken":"{token}"}}"#)),
    );
    options.subscription_topic_filters = vec![filter("svc/get/+")];
    options.response_paths = vec![
        ResponsePath::with_correlation_token_path(filter("svc/get/accepted"), "/clientToken"),
        ResponsePath::with_correlation_token_path(filter("svc/get/rejected"), "/clientToken"),
    ];
    options.correlation_token = Some(token.to_string());
    options
}

/// A service-side client that answers every `svc/get` request on
/// `svc/get/accepted` after `delay`, echoing the request's token.
async fn spawn_responder(broker: &MemoryBroker, delay: Duration) {
    let service = broker.client("service");
    service
        .subscribe(&filter("svc/get"), QoS::AtLeastOnce)
        .await
        .unwrap();
    let mut events = service.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let ClientEvent::Publish(request) = event {
                tokio::time::sleep(delay).await;
                let value: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
                let reply = serde_json::json!({
                    "clientToken": value["clientToken"],
                    "state": { "reported": { "power": "on" } },
                });
                service
                    .publish(
                        "svc/get/accepted",
                        Bytes::from(reply.to_string()),
                        QoS::AtLeastOnce,
                    )
                    .await
                    .unwrap();
            }
        }
    });
}

/// Yield until `predicate` holds, bounded so a broken engine fails the
/// test instead of hanging it.
async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Let every ready task run to its next await point.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn request_resolves_with_correlated_response() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = RequestResponseClient::builder()
        .operation_timeout(Duration::from_secs(5))
        .build(Arc::new(broker.client("device")));
    spawn_responder(&broker, Duration::from_secs(2)).await;

    let response = client
        .submit_request(shadow_get_options("abc123"))
        .await
        .unwrap();

    assert_eq!(response.topic, "svc/get/accepted");
    let value: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(value["clientToken"], "abc123");
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_never_before_the_deadline() {
    let broker = MemoryBroker::new();
    let client = RequestResponseClient::builder()
        .operation_timeout(Duration::from_secs(2))
        .build(Arc::new(broker.client("device")));

    let start = tokio::time::Instant::now();
    let err = client
        .submit_request(shadow_get_options("never-answered"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(2)));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn racing_response_and_timeout_resolve_exactly_once() {
    // Response delay equals the deadline; either outcome is legal but the
    // request must resolve exactly once and leave nothing behind.
    for round in 0..10 {
        let broker = MemoryBroker::new();
        let client = RequestResponseClient::builder()
            .operation_timeout(Duration::from_secs(1))
            .build(Arc::new(broker.client("device")));
        spawn_responder(&broker, Duration::from_secs(1)).await;

        let token = format!("race-{round}");
        match client.submit_request(shadow_get_options(&token)).await {
            Ok(response) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&response.payload).unwrap();
                assert_eq!(value["clientToken"], token.as_str());
            }
            Err(Error::Timeout(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.pending_request_count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn capacity_rejection_leaves_existing_subscriptions_untouched() {
    let broker = MemoryBroker::new();
    let client = Arc::new(
        RequestResponseClient::builder()
            .max_request_response_subscriptions(1)
            .operation_timeout(Duration::from_secs(600))
            .build(Arc::new(broker.client("device"))),
    );

    let mut first = RequestOptions::new("first", Bytes::from(r#"{"clientToken":"t1"}"#));
    first.subscription_topic_filters = vec![filter("first/+")];
    first.response_paths = vec![ResponsePath::with_correlation_token_path(
        filter("first/accepted"),
        "/clientToken",
    )];
    first.correlation_token = Some("t1".to_string());

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit_request(first).await })
    };
    wait_until(|| client.subscriptions_in_use(SubscriptionCategory::RequestResponse) == 1).await;

    let mut second = RequestOptions::new("second", Bytes::from(r#"{"clientToken":"t2"}"#));
    second.subscription_topic_filters = vec![filter("second/+")];
    second.response_paths = vec![ResponsePath::with_correlation_token_path(
        filter("second/accepted"),
        "/clientToken",
    )];
    second.correlation_token = Some("t2".to_string());

    let err = client.submit_request(second).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded {
            category: SubscriptionCategory::RequestResponse,
            in_use: 1,
            max: 1,
        }
    ));

    // The rejection had no side effects.
    assert_eq!(
        client.subscriptions_in_use(SubscriptionCategory::RequestResponse),
        1
    );
    assert_eq!(broker.subscribe_count("device", "first/+"), 1);
    assert_eq!(broker.subscribe_count("device", "second/+"), 0);
    assert_eq!(broker.unsubscribe_count("device", "first/+"), 0);

    in_flight.abort();
}

#[tokio::test(start_paused = true)]
async fn duplicate_correlation_token_is_rejected_before_publish() {
    let broker = MemoryBroker::new();
    let client = Arc::new(
        RequestResponseClient::builder()
            .operation_timeout(Duration::from_secs(600))
            .build(Arc::new(broker.client("device"))),
    );

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit_request(shadow_get_options("dup")).await })
    };
    wait_until(|| client.pending_request_count() == 1).await;

    let err = client
        .submit_request(shadow_get_options("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateCorrelation(t) if t == "dup"));

    // The first request is still in flight and its subscription survives
    // the rejected call's reference being released.
    assert_eq!(client.pending_request_count(), 1);
    assert_eq!(broker.unsubscribe_count("device", "svc/get/+"), 0);

    in_flight.abort();
}

#[tokio::test]
async fn failed_publish_cleans_up_the_pending_request() {
    let broker = MemoryBroker::new();
    let client = RequestResponseClient::builder().build(Arc::new(broker.client("device")));
    broker.fail_next_publishes("device", 1);

    let err = client
        .submit_request(shadow_get_options("pub-fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PublishFailed(_)));
    assert_eq!(client.pending_request_count(), 0);

    wait_until(|| client.subscriptions_in_use(SubscriptionCategory::RequestResponse) == 0).await;
    assert_eq!(broker.unsubscribe_count("device", "svc/get/+"), 1);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_policy_fails_in_flight_requests_on_disconnect() {
    let broker = MemoryBroker::new();
    let client = Arc::new(
        RequestResponseClient::builder()
            .disconnect_policy(DisconnectPolicy::FailFast)
            .operation_timeout(Duration::from_secs(600))
            .build(Arc::new(broker.client("device"))),
    );

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit_request(shadow_get_options("ff")).await })
    };
    wait_until(|| client.pending_request_count() == 1).await;
    settle().await;

    broker.drop_connection("device");

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::TransportDisconnected)));
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn wait_for_timeout_policy_keeps_requests_pending_across_disconnect() {
    let broker = MemoryBroker::new();
    let client = Arc::new(
        RequestResponseClient::builder()
            .operation_timeout(Duration::from_secs(3))
            .build(Arc::new(broker.client("device"))),
    );

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit_request(shadow_get_options("wait")).await })
    };
    wait_until(|| client.pending_request_count() == 1).await;
    settle().await;

    broker.drop_connection("device");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.pending_request_count(), 1);

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn token_less_request_matches_by_response_topic() {
    let broker = MemoryBroker::new();
    let client = RequestResponseClient::builder()
        .operation_timeout(Duration::from_secs(5))
        .build(Arc::new(broker.client("device")));

    // A provisioning-style service whose response carries no token.
    let service = broker.client("service");
    service
        .subscribe(&filter("certs/create"), QoS::AtLeastOnce)
        .await
        .unwrap();
    let mut events = service.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let ClientEvent::Publish(_) = event {
                service
                    .publish(
                        "certs/create/accepted",
                        Bytes::from(r#"{"certificateId":"cert-1"}"#),
                        QoS::AtLeastOnce,
                    )
                    .await
                    .unwrap();
            }
        }
    });

    let mut options = RequestOptions::new("certs/create", Bytes::from("{}"));
    options.subscription_topic_filters = vec![filter("certs/create/+")];
    options.response_paths = vec![ResponsePath::new(filter("certs/create/accepted"))];

    let response = client.submit_request(options).await.unwrap();
    assert_eq!(response.topic, "certs/create/accepted");
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn invalid_options_are_rejected_before_any_side_effect() {
    let broker = MemoryBroker::new();
    let client = RequestResponseClient::builder().build(Arc::new(broker.client("device")));

    // No subscription filters.
    let mut options = RequestOptions::new("svc/get", Bytes::from("{}"));
    options.response_paths = vec![ResponsePath::new(filter("svc/get/accepted"))];
    assert!(matches!(
        client.submit_request(options).await,
        Err(Error::InvalidOptions(_))
    ));

    // Response path not covered by any subscription filter.
    let mut options = shadow_get_options("uncovered");
    options.response_paths = vec![ResponsePath::with_correlation_token_path(
        filter("other/accepted"),
        "/clientToken",
    )];
    assert!(matches!(
        client.submit_request(options).await,
        Err(Error::InvalidOptions(_))
    ));

    // Wildcards are not publishable.
    let mut options = shadow_get_options("wild");
    options.publish_topic = "svc/+".to_string();
    assert!(matches!(
        client.submit_request(options).await,
        Err(Error::InvalidOptions(_))
    ));

    assert_eq!(broker.subscribe_count("device", "svc/get/+"), 0);
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_pending_requests_and_rejects_new_ones() {
    let broker = MemoryBroker::new();
    let client = Arc::new(
        RequestResponseClient::builder()
            .operation_timeout(Duration::from_secs(600))
            .build(Arc::new(broker.client("device"))),
    );

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit_request(shadow_get_options("shut")).await })
    };
    wait_until(|| client.pending_request_count() == 1).await;

    client.shutdown();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Error::ShuttingDown)));
    assert!(matches!(
        client.submit_request(shadow_get_options("late")).await,
        Err(Error::ShuttingDown)
    ));
}
