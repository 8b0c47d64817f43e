//! Presence DLP - Gateway Server
//!
//! One tokio task per connection, one request per connection. Handlers read
//! the shared authorization state and only ever write the heartbeat
//! timestamp; reloads are forwarded to the monitoring loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::protocol::{self, response, Command};
use crate::crypto::constant_time_eq;
use crate::error::{DlpError, DlpResult};
use crate::service::{AuthorizationState, ControlMessage};

/// A client must deliver its request within this time
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a request handler needs
pub struct GatewayContext {
    token: String,
    state: Arc<AuthorizationState>,
    control: Sender<ControlMessage>,
    max_frame_len: usize,
}

impl GatewayContext {
    pub fn new(
        token: String,
        state: Arc<AuthorizationState>,
        control: Sender<ControlMessage>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            token,
            state,
            control,
            max_frame_len,
        }
    }

    /// Answer one raw request payload
    pub fn handle_request(&self, payload: &[u8]) -> Value {
        let request = match protocol::decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("{}", e);
                return response::error(&e.to_string());
            }
        };

        let authentic = request
            .token
            .as_str()
            .is_some_and(|token| constant_time_eq(token.as_bytes(), self.token.as_bytes()));
        if !authentic {
            warn!("Rejected gateway request with an invalid token");
            return response::unauthorized();
        }

        match Command::parse(request.cmd.as_str().unwrap_or(""), request.data.as_ref()) {
            Some(Command::Heartbeat { file_id }) => {
                self.state.record_heartbeat();
                debug!("Heartbeat from viewer (file {:?})", file_id);
                response::heartbeat(self.state.is_authorized())
            }
            Some(Command::ReloadConfig) => match self.control.send(ControlMessage::Reload) {
                Ok(()) => {
                    info!("Configuration reload requested");
                    response::ok()
                }
                Err(_) => response::error("Monitoring loop is not running"),
            },
            Some(Command::GetStatus) => response::status(self.state.is_authorized()),
            None => {
                debug!("Unknown gateway command {:?}", request.cmd);
                response::unknown_command()
            }
        }
    }
}

/// Loopback TCP listener serving the gateway protocol
pub struct Gateway {
    listener: TcpListener,
    context: Arc<GatewayContext>,
}

impl Gateway {
    pub async fn bind(addr: SocketAddr, context: GatewayContext) -> DlpResult<Self> {
        if !addr.ip().is_loopback() {
            return Err(DlpError::Config(format!("gateway must bind to loopback, not {}", addr)));
        }
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> DlpResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> DlpResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &context).await {
                            debug!("Connection from {} dropped: {}", peer, e);
                        }
                    });
                }
                Err(e) => accept_failed(&e).await,
            }
        }
    }
}

/// Accept errors such as descriptor exhaustion persist across retries
async fn accept_failed(e: &std::io::Error) {
    warn!("Gateway accept failed: {}", e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn handle_connection(mut stream: TcpStream, context: &GatewayContext) -> DlpResult<()> {
    let payload = tokio::time::timeout(
        REQUEST_TIMEOUT,
        protocol::read_frame_async(&mut stream, context.max_frame_len),
    )
    .await
    .map_err(|_| DlpError::Protocol("request timed out".into()))??;

    let reply = context.handle_request(&payload);
    protocol::write_frame_async(&mut stream, &protocol::encode(&reply)?).await
}
