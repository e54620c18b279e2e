//! Connection handlers for the Courier server.
//!
//! One tokio task per WebSocket connection. The first event on the
//! authenticated endpoint must be `connect` with a credential; the
//! handler then drives client events through the engine and forwards
//! room envelopes back out. Per-action failures become `error` events
//! for this connection only and never tear the socket down.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use courier_core::{
    ChatError, ChatStore, ConnectionGateway, ConnectionId, ConversationRoomManager, Envelope,
    EventBroadcaster, MessageDispatcher, Notifier, NullNotifier, PresenceRegistry, RoomKey, Rooms,
    RoomsConfig, Session, StaticTokenVerifier, TokenVerifier, TypingIndicatorRelay,
};
use courier_protocol::{codec, ClientEvent, RoleClass, ServerEvent, UserId};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub gateway: ConnectionGateway,
    pub room_manager: ConversationRoomManager,
    pub dispatcher: MessageDispatcher,
    pub typing: TypingIndicatorRelay,
    pub broadcaster: EventBroadcaster,
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<PresenceRegistry>,
    pub rooms: Arc<Rooms>,
    pub config: Config,
}

impl AppState {
    /// Assemble the engine with the built-in in-memory collaborators.
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let mut verifier = StaticTokenVerifier::new();
        for (token, user) in &config.auth.tokens {
            let role = if user.provider {
                RoleClass::ProviderCapable
            } else {
                RoleClass::RequesterOnly
            };
            verifier.insert(token.clone(), UserId::from(user.user_id), role);
        }

        Self::with_collaborators(
            config,
            Arc::new(courier_core::MemoryStore::new()),
            Arc::new(verifier),
            Arc::new(NullNotifier),
        )
    }

    /// Assemble the engine around external collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn ChatStore>,
        verifier: Arc<dyn TokenVerifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let registry = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(Rooms::with_config(RoomsConfig {
            room_capacity: config.limits.room_capacity,
            max_rooms_per_connection: config.limits.max_rooms_per_connection,
        }));
        let broadcaster = EventBroadcaster::new(rooms.clone());

        let gateway = ConnectionGateway::new(
            registry.clone(),
            rooms.clone(),
            broadcaster.clone(),
            verifier,
            store.clone(),
        );
        let room_manager =
            ConversationRoomManager::new(store.clone(), rooms.clone(), broadcaster.clone());
        let dispatcher = MessageDispatcher::new(
            store.clone(),
            registry.clone(),
            rooms.clone(),
            broadcaster.clone(),
            notifier,
        );
        let typing = TypingIndicatorRelay::new(store.clone(), broadcaster.clone());

        Arc::new(Self {
            gateway,
            room_manager,
            dispatcher,
            typing,
            broadcaster,
            store,
            registry,
            rooms,
            config,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config.clone());

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route(&config.transport.feed_path, get(feed_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "Chat endpoint: ws://{}{}  feed: ws://{}{}",
        addr, config.transport.websocket_path, addr, config.transport.feed_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler for authenticated chat sessions.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// WebSocket upgrade handler for the anonymous provider feed.
async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_event(sender: &mut WsSink, event: &ServerEvent) -> Result<()> {
    let text = codec::encode_server(event)?;
    metrics::record_event("outbound");
    sender.send(Message::Text(text)).await?;
    Ok(())
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    tx: mpsc::UnboundedSender<Arc<Envelope>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection lagging behind room broadcast");
                    continue;
                }
            }
        }
    })
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // The handshake: first frame must be a connect event with a valid
    // credential, otherwise the connection is refused with no session.
    let session = match await_handshake(&mut receiver, &state, &connection_id).await {
        Ok(session) => session,
        Err(e) => {
            let _ = send_event(&mut sender, &ServerEvent::error(e.to_string())).await;
            metrics::record_error("authentication");
            debug!(connection = %connection_id, "Handshake refused");
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_users_online(state.registry.online_count());

    let user_id = session.user_id;
    if send_event(
        &mut sender,
        &ServerEvent::PresenceConnected {
            online_users: session.snapshot,
        },
    )
    .await
    .is_err()
    {
        state.gateway.disconnect(user_id, &connection_id);
        return;
    }

    // Merge every joined room into one outbound stream.
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Arc<Envelope>>();
    let mut room_tasks: HashMap<RoomKey, JoinHandle<()>> = HashMap::new();
    room_tasks.insert(
        RoomKey::User(user_id),
        spawn_forwarder(session.personal, sub_tx.clone()),
    );
    room_tasks.insert(
        RoomKey::Presence,
        spawn_forwarder(session.presence, sub_tx.clone()),
    );

    loop {
        tokio::select! {
            biased;

            Some(envelope) = sub_rx.recv() => {
                if envelope.exclude.as_ref() == Some(&connection_id) {
                    continue;
                }
                metrics::record_event("outbound");
                if sender.send(Message::Text((*envelope.payload).clone())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_event("inbound");

                        let event = match codec::decode_client(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                metrics::record_error("decode");
                                if send_event(&mut sender, &ServerEvent::error(e.to_string()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        if let Err(e) = handle_event(
                            event,
                            user_id,
                            &connection_id,
                            &state,
                            &mut sender,
                            &mut room_tasks,
                            &sub_tx,
                        ).await {
                            error!(connection = %connection_id, error = %e, "Event handling error");
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        metrics::record_error("binary_frame");
                        if send_event(&mut sender, &ServerEvent::error("expected text frames"))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.gateway.heartbeat(user_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in room_tasks {
        handle.abort();
    }

    state.gateway.disconnect(user_id, &connection_id);
    metrics::set_active_rooms(state.rooms.room_count());
    metrics::set_users_online(state.registry.online_count());

    debug!(connection = %connection_id, user = %user_id, "WebSocket disconnected");
}

/// Wait for the `connect` handshake event and authenticate it.
async fn await_handshake(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &Arc<AppState>,
    connection_id: &ConnectionId,
) -> Result<Session, ChatError> {
    loop {
        let msg = match receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return Err(ChatError::AuthenticationFailed),
        };
        match msg {
            Message::Text(text) => {
                let Ok(ClientEvent::Connect { token }) = codec::decode_client(&text) else {
                    return Err(ChatError::AuthenticationFailed);
                };
                return state.gateway.connect(connection_id.clone(), &token).await;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(ChatError::AuthenticationFailed),
        }
    }
}

/// Handle one decoded client event.
///
/// Per-action errors are reported to this connection only; the returned
/// error is reserved for transport failures.
#[allow(clippy::too_many_lines)]
async fn handle_event(
    event: ClientEvent,
    user_id: UserId,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    room_tasks: &mut HashMap<RoomKey, JoinHandle<()>>,
    sub_tx: &mpsc::UnboundedSender<Arc<Envelope>>,
) -> Result<()> {
    match event {
        ClientEvent::Connect { .. } => {
            debug!(connection = %connection_id, "Duplicate connect event ignored");
        }

        ClientEvent::Heartbeat => {
            state.gateway.heartbeat(user_id);
        }

        ClientEvent::ChatFocus { peer_id } => {
            state.gateway.chat_focus(user_id, peer_id);
        }

        ClientEvent::ChatBlur => {
            state.gateway.chat_blur(user_id);
        }

        ClientEvent::JoinConversation { conversation_id } => {
            match state
                .room_manager
                .join(user_id, conversation_id, connection_id)
                .await
            {
                Ok(joined) => {
                    let key = RoomKey::Conversation(conversation_id);
                    if let Some(stale) = room_tasks.insert(
                        key,
                        spawn_forwarder(joined.receiver, sub_tx.clone()),
                    ) {
                        stale.abort();
                    }
                    metrics::set_active_rooms(state.rooms.room_count());
                    send_event(sender, &ServerEvent::JoinedConversation { conversation_id })
                        .await?;
                }
                Err(e) => report(sender, e).await?,
            }
        }

        ClientEvent::LeaveConversation { conversation_id } => {
            let key = RoomKey::Conversation(conversation_id);
            if let Some(handle) = room_tasks.remove(&key) {
                handle.abort();
            }
            state.room_manager.leave(conversation_id, connection_id);
            metrics::set_active_rooms(state.rooms.room_count());
            send_event(sender, &ServerEvent::LeftConversation { conversation_id }).await?;
        }

        ClientEvent::FetchMessages {
            conversation_id,
            page,
            limit,
        } => {
            let limit = limit.min(state.config.limits.max_page_limit);
            let result = async {
                let conversation = state
                    .store
                    .conversation(conversation_id)
                    .await?
                    .ok_or(ChatError::ConversationNotFound)?;
                if !conversation.has_participant(user_id) {
                    return Err(ChatError::NotParticipant);
                }
                state.store.messages_page(conversation_id, page, limit).await
            }
            .await;

            match result {
                Ok(messages) => {
                    send_event(
                        sender,
                        &ServerEvent::MessagesFetched {
                            conversation_id,
                            messages,
                            page,
                        },
                    )
                    .await?;
                }
                Err(e) => report(sender, e).await?,
            }
        }

        ClientEvent::GetConversations => match state.store.conversations_for(user_id).await {
            Ok(conversations) => {
                send_event(sender, &ServerEvent::ConversationsFetched { conversations }).await?;
            }
            Err(e) => report(sender, e).await?,
        },

        ClientEvent::GetConversation { conversation_id } => {
            let result = async {
                let conversation = state
                    .store
                    .conversation(conversation_id)
                    .await?
                    .ok_or(ChatError::ConversationNotFound)?;
                if !conversation.has_participant(user_id) {
                    return Err(ChatError::NotParticipant);
                }
                Ok(conversation)
            }
            .await;

            match result {
                Ok(conversation) => {
                    send_event(sender, &ServerEvent::ConversationFetched { conversation }).await?;
                }
                Err(e) => report(sender, e).await?,
            }
        }

        ClientEvent::CreateConversation { other_user_id } => {
            let result = async {
                if let Some(existing) = state
                    .store
                    .conversation_between(user_id, other_user_id)
                    .await?
                {
                    return Ok((existing, false));
                }
                let created = state
                    .store
                    .create_conversation(user_id, other_user_id)
                    .await?;
                Ok((created, true))
            }
            .await;

            match result {
                Ok((conversation, created)) => {
                    if created {
                        state.broadcaster.to_user(
                            other_user_id,
                            &ServerEvent::ConversationCreated {
                                conversation: conversation.clone(),
                            },
                        );
                    }
                    send_event(sender, &ServerEvent::ConversationCreated { conversation })
                        .await?;
                }
                Err(e) => report(sender, e).await?,
            }
        }

        ClientEvent::SendMessage {
            conversation_id,
            draft,
        } => match state.dispatcher.send(user_id, conversation_id, draft).await {
            Ok(message) => {
                metrics::record_message_sent();
                // A sender dispatching from the list view is not in the
                // conversation room; push the record to them directly.
                let room = RoomKey::Conversation(conversation_id);
                if !state.rooms.is_member(connection_id, &room) {
                    send_event(sender, &ServerEvent::NewMessage { message }).await?;
                }
            }
            Err(e) => {
                metrics::record_error("send_message");
                report(sender, e).await?;
            }
        },

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            if let Err(e) = state
                .typing
                .set_typing(user_id, conversation_id, is_typing, connection_id)
                .await
            {
                report(sender, e).await?;
            }
        }

        ClientEvent::SubscribeTopic { kind, id } => {
            let key = RoomKey::Topic(kind, id);
            match state.rooms.join(connection_id, key.clone()) {
                Some(membership) => {
                    if let Some(stale) = room_tasks.insert(
                        key,
                        spawn_forwarder(membership.receiver, sub_tx.clone()),
                    ) {
                        stale.abort();
                    }
                    metrics::set_active_rooms(state.rooms.room_count());
                }
                None => {
                    report(sender, ChatError::store("room limit reached")).await?;
                }
            }
        }

        ClientEvent::UnsubscribeTopic { kind, id } => {
            let key = RoomKey::Topic(kind, id);
            if let Some(handle) = room_tasks.remove(&key) {
                handle.abort();
            }
            state.rooms.leave(connection_id, &key);
            metrics::set_active_rooms(state.rooms.room_count());
        }
    }

    Ok(())
}

/// Report a per-action failure to the acting connection.
async fn report(sender: &mut WsSink, error: ChatError) -> Result<()> {
    send_event(sender, &ServerEvent::error(error.to_string())).await
}

/// Handle an anonymous feed connection: snapshot, then incremental
/// provider-id updates. Read-only; inbound frames are ignored.
async fn handle_feed(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();
    let Some(subscription) = state.gateway.watch_feed(connection_id.clone()) else {
        return;
    };
    metrics::record_feed_viewer(1.0);
    debug!(connection = %connection_id, "Feed viewer connected");

    let (mut sender, mut receiver) = socket.split();
    let mut feed_rx = subscription.receiver;

    let connected = match codec::encode_feed(&subscription.snapshot) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode feed snapshot");
            state.gateway.drop_feed(&connection_id);
            metrics::record_feed_viewer(-1.0);
            return;
        }
    };
    if sender.send(Message::Text(connected)).await.is_err() {
        state.gateway.drop_feed(&connection_id);
        metrics::record_feed_viewer(-1.0);
        return;
    }

    loop {
        tokio::select! {
            update = feed_rx.recv() => {
                match update {
                    Ok(envelope) => {
                        if sender.send(Message::Text((*envelope.payload).clone())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // Read-only feed; ignore input
                }
            }
        }
    }

    state.gateway.drop_feed(&connection_id);
    metrics::record_feed_viewer(-1.0);
    debug!(connection = %connection_id, "Feed viewer disconnected");
}
