use moeviz::event::RoutingEvent;
use std::collections::HashMap;

/// One selectable model as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReportEntry {
    #[serde(rename = "name")]
    pub display_name: String,
    pub expert_count: u32,
}

/// Served client configuration, overriding the client's compiled-in model
/// defaults. Also exposed as JSON on `GET /config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub server_url: String,
    pub models: HashMap<String, ModelReportEntry>,
}

/// Body of `POST /generate`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    pub model_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum WebsocketClientServerMessage {
    Ping,
    Generate {
        request_id: u64,
        prompt: String,
        model_id: String,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum WebsocketServerClientMessage {
    Pong,
    /// Pushed once on connect, and whenever the model set changes.
    ClientConfigReport(ClientConfig),
    RoutingUpdate(RoutingEvent),
    GenerationComplete,
    GenerateReturn {
        request_id: u64,
        result: Result<String, String>,
    },
}
