mod driver;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use driver::GenerationDriver;
use moeviz::topology::ModelRegistry;
use moeviz_server::{
    ClientConfig, GenerateRequest, ModelReportEntry, WebsocketClientServerMessage,
    WebsocketServerClientMessage,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
struct ServerConfig {
    host: String,
    port: u16,
    base_url: String,
    max_new_tokens: u32,
}

impl ServerConfig {
    fn from_env() -> Self {
        let host = std::env::var("MOEVIZ_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("MOEVIZ_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        let base_url = std::env::var("MOEVIZ_BASE_URL")
            .unwrap_or_else(|_| format!("http://{host}:{port}"));
        let max_new_tokens = std::env::var("MOEVIZ_MAX_NEW_TOKENS")
            .ok()
            .and_then(|n| n.parse().ok())
            .unwrap_or(128);
        Self {
            host,
            port,
            base_url,
            max_new_tokens,
        }
    }
}

struct AppState {
    registry: ModelRegistry,
    client_config: ClientConfig,
    events: broadcast::Sender<WebsocketServerClientMessage>,
    driver: GenerationDriver,
}

fn build_client_config(registry: &ModelRegistry, base_url: &str) -> ClientConfig {
    ClientConfig {
        server_url: base_url.to_string(),
        models: registry
            .iter()
            .map(|(id, entry)| {
                (
                    id.to_string(),
                    ModelReportEntry {
                        display_name: entry.display_name.clone(),
                        expert_count: entry.expert_count,
                    },
                )
            })
            .collect(),
    }
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<ClientConfig> {
    Json(state.client_config.clone())
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let entry = state.registry.get(&request.model_id).ok_or((
        StatusCode::BAD_REQUEST,
        format!("unknown model id {:?}", request.model_id),
    ))?;
    let handle = state
        .driver
        .try_start(request.prompt, entry)
        .map_err(|err| (StatusCode::CONFLICT, err))?;
    let message = handle
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(serde_json::json!({ "message": message })))
}

async fn send_message(socket: &mut WebSocket, message: &WebsocketServerClientMessage) -> bool {
    let mut data = Vec::<u8>::new();
    if let Err(err) = ciborium::into_writer(message, &mut data) {
        tracing::error!("failed to encode message: {err}");
        return false;
    }
    socket.send(Message::Binary(data.into())).await.is_ok()
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket: WebSocket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    tracing::debug!("client connected");

    // Opening state: the served model config, so the client can override
    // its compiled-in defaults before any routing data arrives.
    if !send_message(
        &mut socket,
        &WebsocketServerClientMessage::ClientConfigReport(state.client_config.clone()),
    )
    .await
    {
        return;
    }

    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(message) => {
                        if !send_message(&mut socket, &message).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("client lagged, skipped {skipped} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else {
                    tracing::debug!("client disconnected");
                    break;
                };
                match msg {
                    Message::Binary(data) => {
                        match ciborium::from_reader::<WebsocketClientServerMessage, _>(data.to_vec().as_slice()) {
                            Ok(msg) => {
                                if !handle_client_message(&mut socket, &state, msg).await {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!("failed to decode client message: {err:?}");
                            }
                        }
                    }
                    Message::Close(_) => {
                        tracing::debug!("client disconnected");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    msg: WebsocketClientServerMessage,
) -> bool {
    match msg {
        WebsocketClientServerMessage::Ping => {
            send_message(socket, &WebsocketServerClientMessage::Pong).await
        }
        WebsocketClientServerMessage::Generate {
            request_id,
            prompt,
            model_id,
        } => {
            let outcome = match state.registry.get(&model_id) {
                Some(entry) => state.driver.try_start(prompt, entry),
                None => Err(format!("unknown model id {model_id:?}")),
            };
            match outcome {
                Ok(handle) => {
                    // The final text goes out on the shared event channel
                    // once the stream finishes; clients that did not issue
                    // this request drop it by request id.
                    let events = state.events.clone();
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(message) => {
                                let _ = events.send(WebsocketServerClientMessage::GenerateReturn {
                                    request_id,
                                    result: Ok(message),
                                });
                            }
                            Err(err) => {
                                let _ = events.send(WebsocketServerClientMessage::GenerateReturn {
                                    request_id,
                                    result: Err(err.to_string()),
                                });
                            }
                        }
                    });
                    true
                }
                Err(err) => {
                    send_message(
                        socket,
                        &WebsocketServerClientMessage::GenerateReturn {
                            request_id,
                            result: Err(err),
                        },
                    )
                    .await
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ServerConfig::from_env();
    let registry = ModelRegistry::builtin();
    let client_config = build_client_config(&registry, &config.base_url);
    let (events, _) = broadcast::channel(256);
    let state = Arc::new(AppState {
        registry,
        client_config,
        driver: GenerationDriver::new(events.clone(), config.max_new_tokens),
        events,
    });

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/config", get(config_handler))
        .route("/generate", post(generate_handler))
        .route("/ws", get(websocket_handler))
        .nest_service("/pkg", ServeDir::new("./crates/moeviz-webui/pkg/"))
        .nest_service("/assets", ServeDir::new("./crates/moeviz-webui/assets/"))
        .route_service(
            "/index.html",
            ServeFile::new("./crates/moeviz-webui/assets/index.html"),
        )
        .route_service("/", ServeFile::new("./crates/moeviz-webui/assets/index.html"))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind {addr}: {err}");
            return;
        }
    };
    tracing::info!("moeviz server listening on {addr}");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("server error: {err}");
    }
}
