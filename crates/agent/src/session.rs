//! Agent control session (C6, §4.6) — agent side of the bidirectional
//! control-plane stream.
//!
//! Three cooperating tasks: a connection manager, a send pump, and a
//! receive pump, talking to the reconciler via two bounded channels
//! (capacity 100 each, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cosmos_common::proto::control_plane_client::ControlPlaneClient;
use cosmos_common::proto::{agent_message, AgentMessage, ComponentStatus, ControllerMessage, DeploymentResult, Heartbeat, HealthCheckResult};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Request;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::progress::ProgressReporter;

const CHANNEL_CAPACITY: usize = 100;
const INBOUND_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ControlSession {
    hostname: String,
    controller_url: String,
    tls: Option<(Option<String>, Option<(String, String)>)>,
    reconnect_interval: Duration,
    app_tx: mpsc::Sender<AgentMessage>,
    app_rx: Mutex<Option<mpsc::Receiver<AgentMessage>>>,
    inbound_tx: mpsc::Sender<ControllerMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ControllerMessage>>>,
    live: Mutex<Option<mpsc::Sender<AgentMessage>>>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    stopped: AtomicBool,
}

impl ControlSession {
    pub fn new(config: &AgentConfig, hostname: String) -> Arc<Self> {
        let (app_tx, app_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        let tls = config.tls_ca_path.clone().map(|ca| {
            let client_pair = match (&config.tls_client_cert_path, &config.tls_client_key_path) {
                (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
                _ => None,
            };
            (Some(ca), client_pair)
        });

        Arc::new(Self {
            hostname,
            controller_url: config.controller_url.clone(),
            tls,
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            app_tx,
            app_rx: Mutex::new(Some(app_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            live: Mutex::new(None),
            connected_tx,
            connected_rx,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn outbound_sender(&self) -> mpsc::Sender<AgentMessage> {
        self.app_tx.clone()
    }

    /// Takes ownership of the inbound (controller -> agent) command
    /// channel. Must be called exactly once — the reconciler owns it.
    pub fn take_inbound(&self) -> mpsc::Receiver<ControllerMessage> {
        self.inbound_rx.lock().unwrap().take().expect("inbound channel already taken")
    }

    fn envelope(&self, payload: agent_message::Payload) -> AgentMessage {
        AgentMessage {
            hostname: self.hostname.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            payload: Some(payload),
        }
    }

    /// Enqueue an outbound message with the spec's 1s enqueue timeout
    /// (§5 "Cancellation and timeouts"). Fails loudly only via logging —
    /// callers are fire-and-forget reporters.
    async fn enqueue(&self, payload: agent_message::Payload) {
        let message = self.envelope(payload);
        if self.app_tx.send_timeout(message, OUTBOUND_SEND_TIMEOUT).await.is_err() {
            warn!("timeout sending message to outbound queue");
        }
    }

    /// Runs the connection manager and send pump until `stop()` is
    /// called. Spawns both as background tasks and returns immediately.
    pub fn start(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move { session.connection_manager().await });

        let session = self.clone();
        tokio::spawn(async move { session.send_pump().await });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn send_pump(self: Arc<Self>) {
        let mut app_rx = self.app_rx.lock().unwrap().take().expect("send pump started twice");
        while let Some(message) = app_rx.recv().await {
            if self.is_stopped() {
                break;
            }
            let sender = self.live.lock().unwrap().clone();
            match sender {
                Some(tx) => {
                    if tx.send(message).await.is_err() {
                        debug!("outbound send failed, marking session disconnected");
                        *self.live.lock().unwrap() = None;
                        let _ = self.connected_tx.send(false);
                    }
                }
                None => {
                    debug!("dropping outbound message, not connected");
                }
            }
        }
    }

    async fn connection_manager(self: Arc<Self>) {
        while !self.is_stopped() {
            match self.dial().await {
                Ok((tonic_tx, inbound_tx)) => {
                    *self.live.lock().unwrap() = Some(tonic_tx);
                    let _ = self.connected_tx.send(true);

                    self.run_receive_pump(inbound_tx).await;

                    *self.live.lock().unwrap() = None;
                    let _ = self.connected_tx.send(false);
                }
                Err(err) => {
                    warn!(%err, "failed to connect to controller");
                }
            }

            if self.is_stopped() {
                break;
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    async fn dial(&self) -> anyhow::Result<(mpsc::Sender<AgentMessage>, tonic::Streaming<ControllerMessage>)> {
        let channel = self.build_channel().await?;
        let mut client = ControlPlaneClient::new(channel);

        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let request_stream = ReceiverStream::new(request_rx);
        let response = client.connect(Request::new(request_stream)).await?;
        Ok((request_tx, response.into_inner()))
    }

    async fn build_channel(&self) -> anyhow::Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.controller_url))?
            .timeout(Duration::from_secs(10))
            .tcp_keepalive(Some(Duration::from_secs(30)));

        let endpoint = if let Some((ca_path, client_pair)) = &self.tls {
            let mut tls_config = ClientTlsConfig::new();
            if let Some(ca_path) = ca_path {
                let ca = tokio::fs::read(ca_path).await?;
                tls_config = tls_config.ca_certificate(tonic::transport::Certificate::from_pem(ca));
            }
            if let Some((cert_path, key_path)) = client_pair {
                let cert = tokio::fs::read(cert_path).await?;
                let key = tokio::fs::read(key_path).await?;
                tls_config = tls_config.identity(tonic::transport::Identity::from_pem(cert, key));
            }
            endpoint.tls_config(tls_config)?
        } else {
            endpoint
        };

        Ok(endpoint.connect().await?)
    }

    /// Heartbeats are the reconciler's own responsibility, not routed
    /// through `ProgressReporter` (that trait exists only to keep the
    /// lifecycle engine decoupled from this session).
    pub async fn send_heartbeat(&self, heartbeat: Heartbeat) {
        self.enqueue(agent_message::Payload::Heartbeat(heartbeat)).await;
    }

    async fn run_receive_pump(&self, mut response: tonic::Streaming<ControllerMessage>) {
        loop {
            match response.message().await {
                Ok(Some(msg)) => {
                    match tokio::time::timeout(INBOUND_ENQUEUE_TIMEOUT, self.inbound_tx.send(msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            debug!("inbound channel closed, stopping receive pump");
                            break;
                        }
                        Err(_) => warn!("inbound channel full after 5s, dropping message"),
                    }
                }
                Ok(None) => {
                    debug!("control stream closed (EOF), will reconnect");
                    break;
                }
                Err(status) => {
                    debug!(%status, "control stream closed, will reconnect");
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ProgressReporter for ControlSession {
    async fn report_deployment(&self, result: DeploymentResult) {
        self.enqueue(agent_message::Payload::DeploymentResult(result)).await;
    }

    async fn report_status(&self, status: ComponentStatus) {
        self.enqueue(agent_message::Payload::ComponentStatus(status)).await;
    }

    async fn report_health(&self, result: HealthCheckResult) {
        self.enqueue(agent_message::Payload::HealthCheckResult(result)).await;
    }

    async fn report_log_chunk(&self, component_name: &str, data: Vec<u8>, offset: i64) {
        self.enqueue(agent_message::Payload::LogChunk(cosmos_common::proto::LogChunk {
            component_name: component_name.to_string(),
            log_data: data,
            offset,
            timestamp: chrono::Utc::now().timestamp(),
        }))
        .await;
    }
}
