//! HTTP capability bridge.
//!
//! POSTs `{"name": ..., "args": ...}` as JSON to a fixed endpoint. A 2xx
//! response body is the result; a body of the form `{"result": ...}` is
//! unwrapped. Non-2xx responses fail with the body's `error` field when
//! present.

use std::time::Duration;

use flowline_core::workflow::{Capability, CapabilityError};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct HttpCapability {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCapability {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flowline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CapabilityError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Capability for HttpCapability {
    async fn invoke(&self, name: &str, args: Value) -> Result<Value, CapabilityError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "name": name, "args": args }))
            .send()
            .await
            .map_err(|e| {
                CapabilityError::Transport(format!("request to '{}' failed: {e}", self.endpoint))
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::Transport(format!("failed to read response body: {e}")))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        tracing::debug!(endpoint = self.endpoint.as_str(), name, status = status.as_u16(), "capability call returned");

        if !status.is_success() {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(CapabilityError::Failed(reason));
        }

        match body {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
                Ok(map.remove("result").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one request with a fixed status and JSON body; returns the
    /// endpoint URL and a handle yielding the request body.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let (header_end, content_length) = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let length = text[..pos]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    break (pos + 4, length);
                }
            };
            while buf.len() < header_end + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            let request_body = String::from_utf8_lossy(&buf[header_end..]).to_string();

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request_body
        });

        (format!("http://{addr}/invoke"), handle)
    }

    #[tokio::test]
    async fn test_posts_name_and_args_and_unwraps_result() {
        let (url, server) = serve_once("200 OK", r#"{"result": {"summary": "short"}}"#).await;
        let capability = HttpCapability::new(&url, Duration::from_secs(5)).unwrap();

        let out = capability
            .invoke("summarize", json!({"task": "sum it up"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"summary": "short"}));

        let sent: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent, json!({"name": "summarize", "args": {"task": "sum it up"}}));
    }

    #[tokio::test]
    async fn test_error_status_reports_reason() {
        let (url, _server) = serve_once("500 Internal Server Error", r#"{"error": "model overloaded"}"#).await;
        let capability = HttpCapability::new(&url, Duration::from_secs(5)).unwrap();

        let err = capability.invoke("summarize", Value::Null).await.unwrap_err();
        assert_eq!(err, CapabilityError::Failed("model overloaded".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let capability = HttpCapability::new(&format!("http://{addr}/"), Duration::from_secs(2)).unwrap();
        let err = capability.invoke("x", Value::Null).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Transport(_)));
    }
}
