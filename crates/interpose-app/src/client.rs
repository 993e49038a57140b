//! Blocking client for the control API.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use interpose_core::{ProxyState, StateEvent};
use interpose_server::{ErrorResponse, SettingsResponse, StartRequest};
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon could not be reached or sent an unreadable body.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error body.
    #[error("{message} ({code}, HTTP {status})")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The event stream broke off.
    #[error("event stream error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Machine-readable code, matching the daemon's error codes.
    pub fn code(&self) -> &str {
        match self {
            ClientError::Http(_) => "unreachable",
            ClientError::Api { code, .. } => code,
            ClientError::Io(_) => "stream_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Client for a running `interpose serve`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    /// `base_url` is e.g. `http://127.0.0.1:48780`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub fn for_port(host: &str, port: u16) -> Self {
        Self::new(format!("http://{host}:{port}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> Result<ProxyState> {
        let response = self.client.get(self.url("/api/state")).send()?;
        Ok(check(response)?.json()?)
    }

    pub fn settings(&self) -> Result<SettingsResponse> {
        let response = self.client.get(self.url("/api/settings")).send()?;
        Ok(check(response)?.json()?)
    }

    /// Enables redirection. Omitted fields fall back to the saved target.
    pub fn start(&self, address: Option<String>, port: Option<String>) -> Result<ProxyState> {
        let body = StartRequest {
            address,
            port: port.map(Value::String),
        };
        let response = self.client.post(self.url("/api/start")).json(&body).send()?;
        Ok(check(response)?.json()?)
    }

    pub fn stop(&self) -> Result<ProxyState> {
        let response = self.client.post(self.url("/api/stop")).send()?;
        Ok(check(response)?.json()?)
    }

    pub fn toggle(&self) -> Result<ProxyState> {
        let response = self.client.post(self.url("/api/toggle")).send()?;
        Ok(check(response)?.json()?)
    }

    /// Follows the event stream, calling `on_event` for each event until it
    /// returns `false` or the daemon shuts down.
    pub fn watch<F>(&self, mut on_event: F) -> Result<()>
    where
        F: FnMut(StateEvent) -> bool,
    {
        let streaming = Client::builder().timeout(None::<Duration>).build()?;
        let response = check(streaming.get(self.url("/api/events")).send()?)?;

        for line in BufReader::new(response).lines() {
            let line = line?;
            if let Some(event) = parse_sse_line(&line) {
                if !on_event(event) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text()?;
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("http_error".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

/// Decodes the `data:` line of a server-sent event. Other lines (event
/// names, keep-alive comments, separators) yield `None`.
pub fn parse_sse_line(line: &str) -> Option<StateEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "skipping undecodable event");
            None
        }
    }
}
