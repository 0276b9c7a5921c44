use axum::http::StatusCode;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ElevenLabsConfig;

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// ElevenLabs conversational-agent client.
///
/// Exchanges the agent ID and API key for a short-lived signed WebSocket
/// URL, then dials it. One signed URL is good for one conversation; the
/// bridge fetches a fresh one per connection attempt.
pub struct ElevenLabsClient {
    client: reqwest::Client,
    api_base: String,
    agent_id: String,
    api_key: String,
}

impl ElevenLabsClient {
    pub fn new(config: &ElevenLabsConfig) -> Self {
        Self::with_api_base(config, "https://api.elevenlabs.io")
    }

    pub fn with_api_base(config: &ElevenLabsConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            agent_id: config.agent_id.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Fetch a signed conversation URL. No internal retry; the bridge
    /// owns the retry policy.
    pub async fn fetch_signed_url(&self) -> Result<String, SignedUrlError> {
        let url = format!("{}/v1/convai/conversation/get_signed_url", self.api_base);

        let resp = self
            .client
            .get(&url)
            .query(&[("agent_id", &self.agent_id)])
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| SignedUrlError::Request(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SignedUrlError::Auth(status.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SignedUrlError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SignedUrlError::Parse(e.to_string()))?;

        extract_signed_url(&body).ok_or_else(|| {
            SignedUrlError::Parse("response carries neither signed_url nor url".to_string())
        })
    }

    /// Fetch a signed URL and open the conversation WebSocket.
    pub async fn open_conversation(&self) -> Result<AgentSocket, ConnectError> {
        let url = self.fetch_signed_url().await?;
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ConnectError::WebSocket(e.to_string()))?;
        tracing::debug!(agent_id = %self.agent_id, "Agent WebSocket open");
        Ok(socket)
    }
}

/// Pull the conversation URL out of the response body. Providers have
/// shipped both `signed_url` and `url`; prefer the former.
fn extract_signed_url(body: &serde_json::Value) -> Option<String> {
    body.get("signed_url")
        .or_else(|| body.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[derive(Debug, thiserror::Error)]
pub enum SignedUrlError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Authentication rejected: {0}")]
    Auth(String),
    #[error("ElevenLabs API error: {0}")]
    Api(String),
    #[error("Malformed signed-url response: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    SignedUrl(#[from] SignedUrlError),
    #[error("WebSocket connect failed: {0}")]
    WebSocket(String),
}
