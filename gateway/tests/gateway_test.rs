use async_trait::async_trait;
use irl_core::auth::DEFAULT_TOKEN_TTL;
use irl_core::{
    Claims, DecisionEngine, InMemoryKvStore, IrlConfig, IrlError, KvStore, QuotaAllocation,
    StubDecisionEngine, ThrottlingDecision,
};
use std::collections::HashMap;
use irl_gateway::{
    serve_connection, AccessRequest, ClientMessage, Connection, ConnectionInitPayload,
    ConnectionState, GatewayServices, Operation, ServerMessage, SubscriptionGateway,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

const SECRET: &str = "gateway-test-secret";

fn seeded_store() -> Arc<InMemoryKvStore> {
    let store = InMemoryKvStore::new();
    store.hset("agent:agent-1", "name", "Ada");
    store.hset("agent:agent-1", "tier", "STARTUP");
    store.hset("quota:agent-1", "requestsPerMinute", "60");
    store.hset("quota:agent-1", "requestsPerHour", "3600");
    store
}

fn config() -> IrlConfig {
    IrlConfig {
        jwt_secret: SECRET.to_string(),
        ..Default::default()
    }
}

fn gateway_with(engine: Arc<dyn DecisionEngine>) -> SubscriptionGateway {
    SubscriptionGateway::new(GatewayServices::new(seeded_store(), engine, &config()))
}

fn gateway() -> SubscriptionGateway {
    gateway_with(Arc::new(StubDecisionEngine))
}

fn bearer(gateway: &SubscriptionGateway, role: Option<&str>) -> String {
    let claims = match role {
        Some(r) => Claims::new("user-1").with_role(r),
        None => Claims::new("user-1"),
    };
    let token = gateway
        .services()
        .auth
        .sign(claims, DEFAULT_TOKEN_TTL)
        .expect("sign");
    format!("Bearer {token}")
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<ServerMessage>) {
    let extra = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected frame: {extra:?}");
}

async fn open(
    gateway: &SubscriptionGateway,
    authorization: Option<String>,
) -> (Connection, mpsc::Receiver<ServerMessage>) {
    let (mut conn, mut rx) = gateway.connect();
    assert_eq!(conn.state(), ConnectionState::Connecting);
    conn.handle(ClientMessage::ConnectionInit {
        payload: Some(ConnectionInitPayload { authorization }),
    })
    .await;
    assert_eq!(next_frame(&mut rx).await, ServerMessage::ConnectionAck);
    assert_eq!(conn.state(), ConnectionState::Open);
    (conn, rx)
}

fn subscribe(id: &str, payload: Operation) -> ClientMessage {
    ClientMessage::Subscribe {
        id: id.to_string(),
        payload,
    }
}

fn quota_updates(agent: &str) -> Operation {
    Operation::QuotaUpdates {
        agent_id: agent.to_string(),
    }
}

fn error_code(frame: &ServerMessage) -> (&str, Option<&str>) {
    match frame {
        ServerMessage::Error { id, payload } => (payload[0].code.as_str(), id.as_deref()),
        other => panic!("expected error frame, got {other:?}"),
    }
}

fn data(frame: &ServerMessage, id: &str) -> serde_json::Value {
    match frame {
        ServerMessage::Next { id: got, payload } => {
            assert_eq!(got, id);
            payload["data"].clone()
        }
        other => panic!("expected next frame, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthenticated_subscription_is_rejected_but_connection_stays_usable() {
    let gateway = gateway();
    let (mut conn, mut rx) = open(&gateway, None).await;

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(error_code(&next_frame(&mut rx).await), ("UNAUTHENTICATED", Some("s1")));
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(
        gateway
            .services()
            .event_bus
            .subscriber_count(&"agent-1".to_string())
            .await,
        0
    );

    conn.handle(subscribe(
        "q1",
        Operation::Quota {
            agent_id: "agent-1".into(),
        },
    ))
    .await;
    let quota = data(&next_frame(&mut rx).await, "q1");
    assert_eq!(quota["quota"]["requestsPerMinute"], 60);
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Complete { id: "q1".into() }
    );
}

#[tokio::test]
async fn invalid_credential_opens_anonymous_connection() {
    let gateway = gateway();
    let (mut conn, mut rx) = open(&gateway, Some("Bearer not-a-token".into())).await;
    assert!(conn.identity().is_none());

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(error_code(&next_frame(&mut rx).await).0, "UNAUTHENTICATED");
}

#[tokio::test]
async fn non_admin_override_is_unauthorized_and_publishes_nothing() {
    let gateway = gateway();
    let auth = bearer(&gateway, Some("viewer"));
    let (mut conn, mut rx) = open(&gateway, Some(auth)).await;
    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;

    conn.handle(subscribe(
        "m1",
        Operation::RequestOverride {
            agent_id: "agent-1".into(),
            amount: 100,
        },
    ))
    .await;
    assert_eq!(error_code(&next_frame(&mut rx).await), ("UNAUTHORIZED", Some("m1")));
    let stats = gateway
        .services()
        .event_bus
        .get_stats(&"agent-1".to_string())
        .expect("topic stats");
    assert_eq!(stats.total_published, 0);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn admin_override_reaches_subscriber_exactly_once() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let admin = bearer(&gateway, Some("admin"));

    let (mut watcher, mut watcher_rx) = open(&gateway, Some(user)).await;
    watcher.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(watcher.active_subscriptions(), 1);

    let (mut operator, mut operator_rx) = open(&gateway, Some(admin)).await;
    operator
        .handle(subscribe(
            "m1",
            Operation::RequestOverride {
                agent_id: "agent-1".into(),
                amount: 100,
            },
        ))
        .await;
    let result = data(&next_frame(&mut operator_rx).await, "m1");
    assert_eq!(result["requestOverride"]["requestsPerMinute"], 100);
    assert_eq!(
        next_frame(&mut operator_rx).await,
        ServerMessage::Complete { id: "m1".into() }
    );

    let event = data(&next_frame(&mut watcher_rx).await, "s1");
    let snapshot = &event["quotaUpdates"];
    assert_eq!(snapshot["agentId"], "agent-1");
    assert_eq!(snapshot["quota"]["requestsPerMinute"], 100);
    assert_eq!(snapshot["quota"]["requestsPerHour"], 6000);
    assert_quiet(&mut watcher_rx).await;

    let stats = gateway
        .services()
        .event_bus
        .get_stats(&"agent-1".to_string())
        .expect("topic stats");
    assert_eq!(stats.total_published, 1);
    assert_eq!(stats.total_delivered, 1);
}

#[tokio::test]
async fn subscriber_to_other_agent_sees_nothing() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let (mut conn, mut rx) = open(&gateway, Some(user)).await;
    conn.handle(subscribe("s2", quota_updates("agent-2"))).await;

    let ctx = gateway
        .services()
        .request_context(Some(&bearer(&gateway, Some("admin"))));
    irl_gateway::resolvers::request_override(&ctx, "agent-1", 5)
        .await
        .unwrap();

    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn complete_stops_delivery() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let (mut conn, mut rx) = open(&gateway, Some(user)).await;
    let bus = Arc::clone(&gateway.services().event_bus);
    let key = "agent-1".to_string();

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(bus.subscriber_count(&key).await, 1);

    conn.handle(ClientMessage::Complete { id: "s1".into() }).await;
    assert_eq!(bus.subscriber_count(&key).await, 0);
    assert_eq!(conn.active_subscriptions(), 0);

    let delivered = bus
        .publish(
            &key,
            irl_core::StateSnapshot::new("agent-1", QuotaAllocation::default()),
        )
        .await;
    assert_eq!(delivered, 0);
    assert_quiet(&mut rx).await;

    // the id can be reused once completed
    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(bus.subscriber_count(&key).await, 1);
}

#[tokio::test]
async fn duplicate_operation_id_is_rejected() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let (mut conn, mut rx) = open(&gateway, Some(user)).await;

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(
        error_code(&next_frame(&mut rx).await),
        ("DUPLICATE_OPERATION", Some("s1"))
    );
    assert_eq!(conn.active_subscriptions(), 1);
}

#[tokio::test]
async fn operations_before_init_are_rejected() {
    let gateway = gateway();
    let (mut conn, mut rx) = gateway.connect();

    conn.handle(subscribe("q1", Operation::ServerVersion)).await;
    assert_eq!(
        error_code(&next_frame(&mut rx).await),
        ("NOT_INITIALISED", Some("q1"))
    );

    conn.handle(ClientMessage::Ping).await;
    assert_eq!(next_frame(&mut rx).await, ServerMessage::Pong);
}

#[tokio::test]
async fn close_detaches_every_subscription() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let (mut conn, _rx) = open(&gateway, Some(user)).await;
    let bus = Arc::clone(&gateway.services().event_bus);

    conn.handle(subscribe("a", quota_updates("agent-1"))).await;
    conn.handle(subscribe("b", quota_updates("agent-1"))).await;
    conn.handle(subscribe("c", quota_updates("agent-2"))).await;
    assert_eq!(bus.topic_count(), 2);
    assert_eq!(gateway.connection_count(), 1);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(bus.topic_count(), 0);
    assert_eq!(gateway.connection_count(), 0);
}

#[tokio::test]
async fn agent_query_resolves_nested_fields() {
    let gateway = gateway();
    let (mut conn, mut rx) = open(&gateway, None).await;

    conn.handle(subscribe(
        "q1",
        Operation::Agent {
            id: "agent-1".into(),
            quotas: true,
            audit_trail: Some(5),
        },
    ))
    .await;
    let agent = data(&next_frame(&mut rx).await, "q1");
    assert_eq!(agent["agent"]["name"], "Ada");
    assert_eq!(agent["agent"]["tier"], "STARTUP");
    assert_eq!(agent["agent"]["quotas"]["requestsPerHour"], 3600);
    assert_eq!(agent["agent"]["auditTrail"], serde_json::json!([]));
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Complete { id: "q1".into() }
    );

    conn.handle(subscribe(
        "q2",
        Operation::Agent {
            id: "ghost".into(),
            quotas: false,
            audit_trail: None,
        },
    ))
    .await;
    let missing = data(&next_frame(&mut rx).await, "q2");
    assert!(missing["agent"].is_null());
}

struct DenyAll;

#[async_trait]
impl DecisionEngine for DenyAll {
    async fn decide(&self, _agent_id: &str, _action: &str) -> irl_core::Result<ThrottlingDecision> {
        Ok(ThrottlingDecision {
            allowed: false,
            reason: Some("rate limit exceeded".into()),
            estimated_wait_time: Some(1_000),
            next_available_slot: None,
            snapshot: None,
        })
    }

    async fn override_quota(&self, _agent_id: &str, _amount: i64) -> irl_core::Result<QuotaAllocation> {
        Err(IrlError::Decision("overrides disabled".into()))
    }
}

#[tokio::test]
async fn denied_access_publishes_current_quota() {
    let gateway = gateway_with(Arc::new(DenyAll));
    let user = bearer(&gateway, None);
    let (mut watcher, mut watcher_rx) = open(&gateway, Some(user)).await;
    watcher.handle(subscribe("s1", quota_updates("agent-1"))).await;

    let (mut caller, mut caller_rx) = open(&gateway, None).await;
    caller
        .handle(subscribe(
            "m1",
            Operation::RequestAccess {
                input: AccessRequest {
                    agent_id: "agent-1".into(),
                    action: "generate".into(),
                },
            },
        ))
        .await;
    let decision = data(&next_frame(&mut caller_rx).await, "m1");
    assert_eq!(decision["requestAccess"]["allowed"], false);
    assert_eq!(decision["requestAccess"]["estimatedWaitTime"], 1000);

    let event = data(&next_frame(&mut watcher_rx).await, "s1");
    assert_eq!(event["quotaUpdates"]["quota"]["requestsPerMinute"], 60);
}

#[tokio::test]
async fn engine_failure_is_reported_per_operation() {
    let gateway = gateway_with(Arc::new(DenyAll));
    let admin = bearer(&gateway, Some("admin"));
    let (mut conn, mut rx) = open(&gateway, Some(admin)).await;

    conn.handle(subscribe(
        "m1",
        Operation::RequestOverride {
            agent_id: "agent-1".into(),
            amount: 1,
        },
    ))
    .await;
    assert_eq!(error_code(&next_frame(&mut rx).await), ("DECISION_FAILED", Some("m1")));
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn serve_connection_handles_frames_and_server_shutdown() {
    let gateway = Arc::new(gateway());
    let (conn, mut rx) = gateway.connect();
    let (frames_tx, frames_rx) = mpsc::channel::<String>(16);

    let served = tokio::spawn(serve_connection(conn, ReceiverStream::new(frames_rx)));

    frames_tx
        .send(format!(
            r#"{{"type":"connection_init","payload":{{"authorization":"{}"}}}}"#,
            bearer(&gateway, None)
        ))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut rx).await, ServerMessage::ConnectionAck);

    frames_tx.send("{not json".to_string()).await.unwrap();
    assert_eq!(error_code(&next_frame(&mut rx).await), ("BAD_REQUEST", None));

    frames_tx
        .send(r#"{"type":"subscribe","id":"s1","payload":{"operation":"quotaUpdates","variables":{"agentId":"agent-1"}}}"#.to_string())
        .await
        .unwrap();
    frames_tx.send(r#"{"type":"ping"}"#.to_string()).await.unwrap();
    assert_eq!(next_frame(&mut rx).await, ServerMessage::Pong);
    assert_eq!(
        gateway
            .services()
            .event_bus
            .subscriber_count(&"agent-1".to_string())
            .await,
        1
    );

    gateway.shutdown().await;
    timeout(Duration::from_millis(500), served)
        .await
        .expect("connection task ends on shutdown")
        .unwrap();
    assert_eq!(gateway.connection_count(), 0);
    assert_eq!(gateway.services().event_bus.topic_count(), 0);
}

#[tokio::test]
async fn client_disconnect_closes_connection() {
    let gateway = gateway();
    let (conn, mut rx) = gateway.connect();
    let (frames_tx, frames_rx) = mpsc::channel::<String>(4);
    let served = tokio::spawn(serve_connection(conn, ReceiverStream::new(frames_rx)));

    frames_tx
        .send(r#"{"type":"connection_init"}"#.to_string())
        .await
        .unwrap();
    assert_eq!(next_frame(&mut rx).await, ServerMessage::ConnectionAck);
    drop(frames_tx);

    timeout(Duration::from_millis(500), served).await.unwrap().unwrap();
    assert_eq!(gateway.connection_count(), 0);
    // outbound closes once the connection is gone
    assert!(timeout(Duration::from_millis(500), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn server_can_disconnect_a_single_connection() {
    let gateway = gateway();
    let (conn, _rx) = gateway.connect();
    let (other, _other_rx) = gateway.connect();
    let id = conn.id();
    let (_frames_tx, frames_rx) = mpsc::channel::<String>(4);
    let served = tokio::spawn(serve_connection(conn, ReceiverStream::new(frames_rx)));

    assert!(gateway.disconnect(id));
    timeout(Duration::from_millis(500), served).await.unwrap().unwrap();
    assert_eq!(gateway.connection_count(), 1);
    assert!(!gateway.disconnect(id));
    assert!(!other.cancelled_token().is_cancelled());
}

// Quota lookups take `delay`; everything else answers at once.
struct SlowQuotas {
    inner: Arc<InMemoryKvStore>,
    delay: Duration,
}

#[async_trait]
impl KvStore for SlowQuotas {
    async fn hash_get_all(&self, key: &str) -> irl_core::Result<HashMap<String, String>> {
        if key.starts_with("quota:") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.hash_get_all(key).await
    }

    async fn list_range(&self, key: &str, start: i64, end: i64) -> irl_core::Result<Vec<String>> {
        self.inner.list_range(key, start, end).await
    }
}

fn slow_gateway(delay: Duration) -> SubscriptionGateway {
    let store = Arc::new(SlowQuotas {
        inner: seeded_store(),
        delay,
    });
    SubscriptionGateway::new(GatewayServices::new(
        store,
        Arc::new(StubDecisionEngine),
        &config(),
    ))
}

#[tokio::test]
async fn slow_query_does_not_hold_up_complete() {
    let gateway = slow_gateway(Duration::from_secs(1));
    let user = bearer(&gateway, None);
    let (mut conn, mut rx) = open(&gateway, Some(user)).await;
    let bus = Arc::clone(&gateway.services().event_bus);
    let key = "agent-1".to_string();

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    let started = tokio::time::Instant::now();
    conn.handle(subscribe(
        "q1",
        Operation::Quota {
            agent_id: "agent-1".into(),
        },
    ))
    .await;
    conn.handle(ClientMessage::Complete { id: "s1".into() }).await;
    conn.handle(ClientMessage::Ping).await;

    assert_eq!(next_frame(&mut rx).await, ServerMessage::Pong);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(bus.subscriber_count(&key).await, 0);
    assert_eq!(
        bus.publish(
            &key,
            irl_core::StateSnapshot::new("agent-1", QuotaAllocation::default()),
        )
        .await,
        0
    );
    assert_eq!(conn.active_operations(), 1);

    // cancelling the query withholds its result
    conn.handle(ClientMessage::Complete { id: "q1".into() }).await;
    assert_eq!(conn.active_operations(), 0);
    let late = timeout(Duration::from_millis(1_500), rx.recv()).await;
    assert!(late.is_err(), "unexpected frame: {late:?}");
}

#[tokio::test]
async fn close_cancels_running_queries() {
    let gateway = slow_gateway(Duration::from_secs(1));
    let (mut conn, mut rx) = open(&gateway, None).await;

    conn.handle(subscribe(
        "q1",
        Operation::Quota {
            agent_id: "agent-1".into(),
        },
    ))
    .await;
    conn.close().await;
    assert_eq!(conn.active_operations(), 0);
    drop(conn);

    // the query task lets go of the outbound queue without reporting
    let end = timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(matches!(end, Ok(None)), "got {end:?}");
}

#[tokio::test]
async fn server_ended_subscription_is_forgotten() {
    let gateway = gateway();
    let user = bearer(&gateway, None);
    let (mut conn, mut rx) = open(&gateway, Some(user)).await;

    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(conn.active_subscriptions(), 1);

    gateway.services().event_bus.shutdown().await;
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Complete { id: "s1".into() }
    );

    conn.handle(ClientMessage::Ping).await;
    assert_eq!(next_frame(&mut rx).await, ServerMessage::Pong);
    assert_eq!(conn.active_subscriptions(), 0);
    assert_eq!(conn.active_operations(), 0);

    // the id is free again
    conn.handle(subscribe("s1", quota_updates("agent-1"))).await;
    assert_eq!(conn.active_subscriptions(), 1);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn finished_queries_free_their_id() {
    let gateway = gateway();
    let (mut conn, mut rx) = open(&gateway, None).await;

    for _ in 0..2 {
        conn.handle(subscribe("q1", Operation::ServerVersion)).await;
        let version = data(&next_frame(&mut rx).await, "q1");
        assert!(version["serverVersion"].is_string());
        assert_eq!(
            next_frame(&mut rx).await,
            ServerMessage::Complete { id: "q1".into() }
        );
    }
    conn.handle(ClientMessage::Ping).await;
    assert_eq!(next_frame(&mut rx).await, ServerMessage::Pong);
    assert_eq!(conn.active_operations(), 0);
}
