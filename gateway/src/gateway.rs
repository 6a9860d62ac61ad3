//! Live connections and their quota subscriptions.
//!
//! A [`Connection`] is driven by one task (see [`serve_connection`]). Its
//! identity is resolved once from `connection_init` and never changes. Every
//! accepted operation runs on its own task under a child of the connection's
//! cancellation token, so a slow query never holds up `complete` or `ping`.
//! A `quotaUpdates` operation also attaches one bus subscriber whose
//! deliveries become `next` frames on the connection's bounded outbound
//! queue.

use crate::context::{GatewayServices, RequestContext};
use crate::protocol::{ClientMessage, ConnectionInitPayload, Operation, ServerMessage};
use crate::resolvers;
use crate::{OperationError, OperationResult};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use irl_core::{Identity, StateSnapshot, SubscriberHandle, SubscriptionStream};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

/// Accepts connections and owns server-initiated teardown.
pub struct SubscriptionGateway {
    services: GatewayServices,
    // connection id -> teardown token
    connections: Arc<DashMap<u64, CancellationToken>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl SubscriptionGateway {
    pub fn new(services: GatewayServices) -> Self {
        Self {
            services,
            connections: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn services(&self) -> &GatewayServices {
        &self.services
    }

    /// Register a transport session. Frames for the client arrive on the
    /// returned receiver.
    pub fn connect(&self) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.services.outbound_capacity);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        self.connections.insert(id, cancel.clone());
        debug!(connection_id = id, "Connection accepted");

        let connection = Connection {
            id,
            services: self.services.clone(),
            state: ConnectionState::Connecting,
            identity: None,
            outbound: tx,
            operations: HashMap::new(),
            next_seq: 0,
            finished_tx,
            finished_rx,
            cancel,
            registry: Arc::clone(&self.connections),
        };
        (connection, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tear down one connection from the server side.
    pub fn disconnect(&self, connection_id: u64) -> bool {
        match self.connections.get(&connection_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every connection, then detach whatever is still attached.
    pub async fn shutdown(&self) {
        info!(connections = self.connections.len(), "Gateway shutting down");
        self.shutdown.cancel();
        self.services.event_bus.shutdown().await;
    }
}

// One accepted operation. `seq` tells a reused id apart from the task that
// previously ran under it.
struct ActiveOperation {
    seq: u64,
    cancel: CancellationToken,
    subscriber: Option<SubscriberHandle<String, StateSnapshot>>,
}

// Sent by an operation task that ended without being cancelled.
struct Finished {
    id: String,
    seq: u64,
}

pub struct Connection {
    id: u64,
    services: GatewayServices,
    state: ConnectionState,
    identity: Option<Identity>,
    outbound: mpsc::Sender<ServerMessage>,
    operations: HashMap<String, ActiveOperation>,
    next_seq: u64,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    cancel: CancellationToken,
    registry: Arc<DashMap<u64, CancellationToken>>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Fires when the server tears this connection down.
    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscriptions currently registered on this connection
    pub fn active_subscriptions(&self) -> usize {
        self.operations
            .values()
            .filter(|op| op.subscriber.is_some())
            .count()
    }

    /// Queries, mutations and subscriptions currently registered
    pub fn active_operations(&self) -> usize {
        self.operations.len()
    }

    /// Parse and handle one raw frame. Unparseable frames are answered with
    /// an error and otherwise ignored.
    pub async fn handle_frame(&mut self, frame: &str) {
        match serde_json::from_str::<ClientMessage>(frame) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!(connection_id = self.id, error = %e, "Malformed frame");
                let error = OperationError::BadRequest(format!("malformed message: {e}"));
                self.send(ServerMessage::error(None, &error)).await;
            }
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            debug!(connection_id = self.id, "Message after close ignored");
            return;
        }
        self.reap_finished().await;
        match message {
            ClientMessage::ConnectionInit { payload } => self.init(payload.unwrap_or_default()).await,
            ClientMessage::Subscribe { id, payload } => self.start(id, payload).await,
            ClientMessage::Complete { id } => self.complete(&id).await,
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    async fn init(&mut self, payload: ConnectionInitPayload) {
        if self.state != ConnectionState::Connecting {
            let error = OperationError::BadRequest("connection already initialised".into());
            self.send(ServerMessage::error(None, &error)).await;
            return;
        }
        self.state = ConnectionState::Authenticating;
        // anonymous connections still open; operations check for themselves
        self.identity = self
            .services
            .auth
            .resolve_optional(payload.authorization.as_deref());
        self.state = ConnectionState::Open;
        info!(
            connection_id = self.id,
            authenticated = self.identity.is_some(),
            "Connection open"
        );
        self.send(ServerMessage::ConnectionAck).await;
    }

    async fn start(&mut self, id: String, operation: Operation) {
        if self.state != ConnectionState::Open {
            self.send(ServerMessage::error(Some(id.as_str()), &OperationError::NotInitialised))
                .await;
            return;
        }
        if self.operations.contains_key(&id) {
            let error = OperationError::DuplicateOperation(id.clone());
            self.send(ServerMessage::error(Some(id.as_str()), &error)).await;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let cancel = self.cancel.child_token();
        let subscriber = match operation {
            Operation::QuotaUpdates { agent_id } => {
                match self.subscribe(&id, seq, agent_id, cancel.clone()).await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        self.send(ServerMessage::error(Some(id.as_str()), &e)).await;
                        return;
                    }
                }
            }
            other => {
                self.spawn_operation(&id, seq, other, cancel.clone());
                None
            }
        };
        self.operations.insert(
            id,
            ActiveOperation {
                seq,
                cancel,
                subscriber,
            },
        );
    }

    // Queries and mutations each run in their own loader scope.
    fn spawn_operation(&self, id: &str, seq: u64, operation: Operation, cancel: CancellationToken) {
        let ctx = self.services.context_for(self.identity.clone());
        let outbound = self.outbound.clone();
        let finished = self.finished_tx.clone();
        let connection_id = self.id;
        let id = id.to_string();
        tokio::spawn(async move {
            let ended = run_operation(connection_id, &id, operation, &ctx, &outbound, &cancel).await;
            if ended {
                let _ = finished.send(Finished { id, seq });
            }
        });
    }

    async fn subscribe(
        &self,
        id: &str,
        seq: u64,
        agent_id: String,
        cancel: CancellationToken,
    ) -> OperationResult<SubscriberHandle<String, StateSnapshot>> {
        let subject = resolvers::require_identity(self.identity.as_ref())?
            .subject
            .clone();
        if agent_id.trim().is_empty() {
            return Err(OperationError::BadRequest("agentId must not be empty".into()));
        }

        let (handle, stream) = self.services.event_bus.subscribe(agent_id.clone()).await;
        let outbound = self.outbound.clone();
        let finished = self.finished_tx.clone();
        let id = id.to_string();
        info!(
            connection_id = self.id,
            subscription_id = handle.id(),
            operation = %id,
            agent_id = %agent_id,
            subject = %subject,
            "quotaUpdates attached"
        );
        tokio::spawn(async move {
            if forward(&id, stream, &outbound, &cancel).await {
                let _ = finished.send(Finished { id, seq });
            }
        });
        Ok(handle)
    }

    async fn complete(&mut self, id: &str) {
        match self.operations.remove(id) {
            Some(op) => self.detach(op).await,
            None => debug!(connection_id = self.id, operation = id, "Complete for unknown operation"),
        }
    }

    // Drop registrations for operations that ended on their own.
    async fn reap_finished(&mut self) {
        while let Ok(done) = self.finished_rx.try_recv() {
            self.retire(done).await;
        }
    }

    async fn retire(&mut self, done: Finished) {
        let current = self
            .operations
            .get(&done.id)
            .is_some_and(|op| op.seq == done.seq);
        if !current {
            return;
        }
        if let Some(op) = self.operations.remove(&done.id) {
            debug!(connection_id = self.id, operation = %done.id, "Operation finished");
            self.detach(op).await;
        }
    }

    async fn detach(&self, op: ActiveOperation) {
        op.cancel.cancel();
        if let Some(handle) = &op.subscriber {
            self.services.event_bus.unsubscribe(handle).await;
            debug!(
                connection_id = self.id,
                subscription_id = handle.id(),
                "Subscription detached"
            );
        }
    }

    /// Cancel every operation, detach every subscription and leave the
    /// connection `Closed`.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        for (_, op) in std::mem::take(&mut self.operations) {
            self.detach(op).await;
        }
        self.registry.remove(&self.id);
        self.state = ConnectionState::Closed;
        info!(connection_id = self.id, "Connection closed");
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!(connection_id = self.id, "Outbound closed, frame dropped");
        }
    }
}

async fn execute(ctx: &RequestContext, operation: Operation) -> OperationResult<Value> {
    match operation {
        Operation::ServerVersion => to_data(resolvers::server_version()),
        Operation::Agent {
            id,
            quotas,
            audit_trail,
        } => to_data(resolvers::agent_view(ctx, &id, quotas, audit_trail).await?),
        Operation::Quota { agent_id } => to_data(resolvers::quota(ctx, &agent_id).await?),
        Operation::RequestAccess { input } => to_data(resolvers::request_access(ctx, &input).await?),
        Operation::RequestOverride { agent_id, amount } => {
            to_data(resolvers::request_override(ctx, &agent_id, amount).await?)
        }
        Operation::QuotaUpdates { .. } => Err(OperationError::BadRequest(
            "quotaUpdates is a subscription".into(),
        )),
    }
}

fn to_data<T: Serialize>(value: T) -> OperationResult<Value> {
    serde_json::to_value(value).map_err(|e| OperationError::BadRequest(e.to_string()))
}

// Run one query or mutation and report it. Returns false when cancelled.
// A cancelled query is abandoned mid-flight; a mutation always runs to the
// end and only its frames are withheld.
async fn run_operation(
    connection_id: u64,
    id: &str,
    operation: Operation,
    ctx: &RequestContext,
    outbound: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) -> bool {
    let field = operation.field();
    let result = if operation.is_mutation() {
        execute(ctx, operation).await
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(connection_id, operation = id, "Query cancelled");
                return false;
            }
            result = execute(ctx, operation) => result,
        }
    };

    let frames = match result {
        Ok(data) => vec![
            ServerMessage::next(id, field, data),
            ServerMessage::Complete { id: id.to_string() },
        ],
        Err(e) => {
            debug!(connection_id, operation = id, error = %e, "Operation failed");
            vec![ServerMessage::error(Some(id), &e)]
        }
    };
    for frame in frames {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            sent = outbound.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    true
}

// Deliveries for one subscription, until it is cancelled or the bus lets go.
// Returns false when cancelled.
async fn forward(
    id: &str,
    mut stream: SubscriptionStream<StateSnapshot>,
    outbound: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            delivery = stream.recv() => delivery,
        };
        let Some(snapshot) = delivery else { break };

        let data = match serde_json::to_value(&*snapshot) {
            Ok(data) => data,
            Err(e) => {
                warn!(operation = %id, error = %e, "Unserialisable snapshot skipped");
                continue;
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            sent = outbound.send(ServerMessage::next(id, "quotaUpdates", data)) => {
                if sent.is_err() {
                    return true;
                }
            }
        }
    }
    // detached by the server rather than by the client
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = outbound.send(ServerMessage::Complete { id: id.to_string() }) => true,
    }
}

/// Drive `connection` with raw frames from `inbound` until the client goes
/// away or the server tears the connection down, then close it.
pub async fn serve_connection<S>(mut connection: Connection, inbound: S)
where
    S: Stream<Item = String> + Send,
{
    futures::pin_mut!(inbound);
    let cancel = connection.cancelled_token();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(connection_id = connection.id(), "Connection torn down by server");
                break;
            }
            Some(done) = connection.finished_rx.recv() => {
                connection.retire(done).await;
                continue;
            }
            frame = inbound.next() => frame,
        };
        match frame {
            Some(frame) => connection.handle_frame(&frame).await,
            None => break,
        }
    }
    connection.close().await;
}
