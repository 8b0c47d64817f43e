//! Presence DLP - Gateway Client
//!
//! Blocking client used by protected viewers, the opener and the CLI.
//! Transport failures come back as `{"status":"error","message":...}`
//! replies rather than `Err`, so callers handle one shape.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::protocol::{self, response, Command};
use crate::config::ServiceConfig;
use crate::crypto::ProtectedStorage;
use crate::error::{DlpError, DlpResult};

/// What a viewer must do after a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Continue,
    /// Save and exit immediately
    Close,
}

impl HeartbeatVerdict {
    /// Anything but an explicit `continue` means close
    pub fn from_response(reply: &Value) -> Self {
        match reply.get("action").and_then(Value::as_str) {
            Some("continue") => HeartbeatVerdict::Continue,
            _ => HeartbeatVerdict::Close,
        }
    }
}

/// Gateway client
pub struct GatewayClient {
    addr: SocketAddr,
    token: Option<String>,
    timeout: Duration,
    max_frame_len: usize,
}

impl GatewayClient {
    pub fn new(addr: SocketAddr, token: Option<String>, timeout: Duration) -> Self {
        Self {
            addr,
            token,
            timeout,
            max_frame_len: 1024 * 1024,
        }
    }

    /// Client for the configured service; a missing or unreadable token
    /// leaves the client unauthenticated
    pub fn from_config(config: &ServiceConfig, store: &dyn ProtectedStorage) -> Self {
        let token = match super::load_token(&config.token_path(), store) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!("Gateway token unavailable: {}", e);
                None
            }
        };

        Self {
            addr: config.gateway_addr(),
            token,
            timeout: config.client_timeout(),
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Send a command and return the service's reply
    pub fn send_command(&self, command: Command) -> Value {
        let Some(token) = self.token.as_deref() else {
            return response::error("Auth token missing (service not running?)");
        };

        let reply = protocol::encode(&command.into_request(token))
            .and_then(|request| self.exchange(&request));
        match reply {
            Ok(reply) => reply,
            Err(e) => response::error(&e.to_string()),
        }
    }

    pub fn heartbeat(&self, file_id: i64) -> Value {
        self.send_command(Command::Heartbeat {
            file_id: Some(file_id),
        })
    }

    pub fn reload_config(&self) -> Value {
        self.send_command(Command::ReloadConfig)
    }

    pub fn get_status(&self) -> Value {
        self.send_command(Command::GetStatus)
    }

    fn exchange(&self, request: &[u8]) -> DlpResult<Value> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| DlpError::ServiceUnreachable(format!("{}: {}", self.addr, e)))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        protocol::write_frame(&mut stream, request)?;
        let payload = protocol::read_frame(&mut stream, self.max_frame_len)?;
        protocol::decode_response(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::server::{Gateway, GatewayContext};
    use crate::service::{AuthorizationState, ControlMessage};
    use crossbeam_channel::Receiver;
    use serde_json::json;
    use std::sync::Arc;

    const TOKEN: &str = "feedfacecafebeef";

    async fn spawn_gateway() -> (SocketAddr, Arc<AuthorizationState>, Receiver<ControlMessage>) {
        let state = Arc::new(AuthorizationState::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        let context = GatewayContext::new(TOKEN.into(), Arc::clone(&state), tx, 4096);
        let gateway = Gateway::bind("127.0.0.1:0".parse().unwrap(), context).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());
        (addr, state, rx)
    }

    #[test]
    fn test_heartbeat_verdict() {
        assert_eq!(
            HeartbeatVerdict::from_response(&json!({ "action": "continue" })),
            HeartbeatVerdict::Continue
        );
        assert_eq!(
            HeartbeatVerdict::from_response(&json!({ "action": "close" })),
            HeartbeatVerdict::Close
        );
        assert_eq!(
            HeartbeatVerdict::from_response(&response::error("Service connection refused")),
            HeartbeatVerdict::Close
        );
    }

    #[test]
    fn test_missing_token() {
        let client = GatewayClient::new("127.0.0.1:1".parse().unwrap(), None, Duration::from_millis(200));
        assert!(response::is_error(&client.get_status()));
    }

    #[test]
    fn test_unreachable_service() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = GatewayClient::new(addr, Some(TOKEN.into()), Duration::from_millis(500));
        let reply = client.get_status();
        assert!(response::is_error(&reply));
        assert_eq!(HeartbeatVerdict::from_response(&client.heartbeat(1)), HeartbeatVerdict::Close);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end() {
        let (addr, state, rx) = spawn_gateway().await;

        let reply = tokio::task::spawn_blocking(move || {
            let client = GatewayClient::new(addr, Some(TOKEN.into()), Duration::from_secs(2));
            (client.get_status(), client.heartbeat(7), client.reload_config())
        })
        .await
        .unwrap();

        assert_eq!(reply.0, json!({ "status": "ok", "authorized": false }));
        assert_eq!(reply.1, json!({ "action": "close" }));
        assert_eq!(reply.2, json!({ "status": "ok" }));
        assert!(state.since_last_heartbeat().is_some());
        assert_eq!(rx.try_recv().unwrap(), ControlMessage::Reload);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_wrong_token() {
        let (addr, state, _rx) = spawn_gateway().await;

        let reply = tokio::task::spawn_blocking(move || {
            GatewayClient::new(addr, Some("not-the-token".into()), Duration::from_secs(2)).heartbeat(7)
        })
        .await
        .unwrap();

        assert_eq!(reply, response::unauthorized());
        assert!(state.since_last_heartbeat().is_none());
    }
}
