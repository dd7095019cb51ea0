//! Browser visualization over HTTP and WebSocket
//!
//! Routes:
//! - `GET /` plotting page
//! - `GET /api/stream` descriptor of the bound stream
//! - `GET /api/samples?max=N` most recent buffered samples (wire format)
//! - `GET /ws` push channel: `{"type":"stream_info",...}` then one
//!   `{"type":"sample","data":{...}}` per update
//!
//! The server runs on its own tokio runtime thread so callers stay synchronous.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use crossbeam_channel::{bounded, Receiver};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::constants::JOIN_TIMEOUT;
use crate::error::VisualizationError;
use crate::relay::WireMessage;
use crate::stream::buffer::SampleHistory;
use crate::types::{Sample, StreamDescriptor};
use crate::viz::{VisualizationBackend, VizOptions};

const PUSH_CHANNEL_CAPACITY: usize = 1024;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Messages pushed to WebSocket clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum PushMessage {
    StreamInfo(StreamDescriptor),
    Sample(WireMessage),
}

impl PushMessage {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self)
            .map_err(|e| tracing::debug!("Failed to serialize push message: {}", e))
            .ok()
    }
}

struct WebState {
    /// Stream currently bound to the backend
    descriptor: RwLock<Option<StreamDescriptor>>,
    history: SampleHistory,
    /// Serialized messages fanned out to every websocket
    updates: broadcast::Sender<String>,
}

#[derive(Clone)]
struct AppState {
    web: Arc<WebState>,
    shutdown: watch::Receiver<bool>,
}

struct ServerHandle {
    shutdown: watch::Sender<bool>,
    /// Signalled when the server thread exits
    done_rx: Receiver<()>,
    thread: JoinHandle<()>,
    /// Actual bound address (port 0 resolved)
    addr: SocketAddr,
}

/// Serves the bound stream to browsers
pub struct WebBackend {
    options: VizOptions,
    state: Arc<WebState>,
    server: Mutex<Option<ServerHandle>>,
}

impl WebBackend {
    pub fn new(options: VizOptions) -> Self {
        let (updates, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(WebState {
                descriptor: RwLock::new(None),
                history: SampleHistory::new(options.buffer_size),
                updates,
            }),
            options,
            server: Mutex::new(None),
        }
    }

    /// Address the server is listening on, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.addr)
    }

    /// Buffered samples, oldest first
    pub fn recent_samples(&self, max: Option<usize>) -> Vec<Sample> {
        self.state.history.recent(max)
    }

    fn router(&self, shutdown: watch::Receiver<bool>) -> Router {
        let state = AppState {
            web: self.state.clone(),
            shutdown,
        };
        let index = index_page(self.options.update_rate, self.options.buffer_size);

        Router::new()
            .route("/", get(move || async move { Html(index) }))
            .route("/api/stream", get(get_stream))
            .route("/api/samples", get(get_samples))
            .route("/ws", get(websocket_handler))
            .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
            .with_state(state)
    }
}

impl VisualizationBackend for WebBackend {
    fn name(&self) -> &'static str {
        "web"
    }

    fn start(&self) -> Result<(), VisualizationError> {
        let mut server = self.server.lock();
        if server.is_some() {
            return Ok(());
        }

        let endpoint = format!("{}:{}", self.options.bind_address, self.options.http_port);
        let listener = std::net::TcpListener::bind(&endpoint)
            .map_err(|e| VisualizationError::Start(format!("failed to bind {}: {}", endpoint, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| VisualizationError::Start(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| VisualizationError::Start(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = bounded::<()>(1);
        let app = self.router(shutdown_rx.clone());

        let thread = thread::Builder::new()
            .name("viz-web".to_string())
            .spawn(move || {
                // Built on this thread so it is never dropped inside a caller's runtime
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("viz-web-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Web visualization runtime failed: {}", e);
                        let _ = done_tx.send(());
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!("Web visualization listener failed: {}", e);
                            return;
                        }
                    };
                    let mut shutdown_rx = shutdown_rx;
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.changed().await;
                        })
                        .await;
                    if let Err(e) = served {
                        tracing::error!("Web visualization server error: {}", e);
                    }
                });
                runtime.shutdown_timeout(Duration::from_millis(500));
                let _ = done_tx.send(());
            })
            .map_err(|e| VisualizationError::Start(e.to_string()))?;

        *server = Some(ServerHandle {
            shutdown: shutdown_tx,
            done_rx,
            thread,
            addr,
        });
        tracing::info!("Web visualization available at http://{}", addr);
        Ok(())
    }

    fn stop(&self) {
        let handle = match self.server.lock().take() {
            Some(handle) => handle,
            None => return,
        };

        let _ = handle.shutdown.send(true);
        match handle.done_rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) => {
                let _ = handle.thread.join();
                tracing::info!("Web visualization stopped");
            }
            Err(_) => tracing::warn!("Web visualization did not stop in time, detaching"),
        }
    }

    fn update(&self, sample: &Sample) {
        if !self.is_running() {
            return;
        }
        self.state.history.push(sample.clone());

        if self.state.updates.receiver_count() == 0 {
            return;
        }
        match WireMessage::from_sample(sample) {
            Ok(message) => {
                if let Some(json) = PushMessage::Sample(message).to_json() {
                    let _ = self.state.updates.send(json);
                }
            }
            Err(e) => tracing::debug!("Skipping sample for display: {}", e),
        }
    }

    fn set_stream(&self, descriptor: StreamDescriptor) {
        let changed = self.state.descriptor.read().as_ref() != Some(&descriptor);
        if changed {
            self.state.history.clear();
        }
        *self.state.descriptor.write() = Some(descriptor.clone());

        if let Some(json) = PushMessage::StreamInfo(descriptor).to_json() {
            let _ = self.state.updates.send(json);
        }
    }

    fn stream(&self) -> Option<StreamDescriptor> {
        self.state.descriptor.read().clone()
    }

    fn is_running(&self) -> bool {
        self.server.lock().is_some()
    }
}

impl Drop for WebBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn get_stream(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<StreamDescriptor>>) {
    let descriptor = state.web.descriptor.read().clone();
    match descriptor {
        Some(descriptor) => (StatusCode::OK, Json(ApiResponse::ok(descriptor))),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::error("No stream selected"))),
    }
}

#[derive(Debug, Deserialize)]
struct SamplesQuery {
    max: Option<usize>,
}

async fn get_samples(
    State(state): State<AppState>,
    Query(query): Query<SamplesQuery>,
) -> Json<ApiResponse<Vec<WireMessage>>> {
    let messages = state
        .web
        .history
        .recent(query.max)
        .iter()
        .filter_map(|s| WireMessage::from_sample(s).ok())
        .collect();
    Json(ApiResponse::ok(messages))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.web.updates.subscribe();
    let mut shutdown = state.shutdown.clone();

    let greeting = state.web.descriptor.read().clone();
    if let Some(json) = greeting.and_then(|d| PushMessage::StreamInfo(d).to_json()) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }
    tracing::info!("WebSocket client connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("WebSocket client lagging, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tracing::info!("WebSocket client disconnected");
}

fn index_page(update_rate: f64, history: usize) -> String {
    let frame_ms = if update_rate > 0.0 { (1000.0 / update_rate).round() as u64 } else { 33 };
    INDEX_TEMPLATE
        .replace("{{FRAME_MS}}", &frame_ms.to_string())
        .replace("{{HISTORY}}", &history.max(1).to_string())
}

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>LSL Stream Visualization</title>
  <script src="https://cdn.plot.ly/plotly-latest.min.js"></script>
  <style>
    body { font-family: sans-serif; margin: 20px; }
    #plot { width: 100%; height: 600px; }
  </style>
</head>
<body>
  <h1>LSL Stream Visualization</h1>
  <div id="info"></div>
  <div id="plot"></div>
  <script>
    const HISTORY = {{HISTORY}};
    const channels = [];
    let dirty = false;
    const ws = new WebSocket(`ws://${location.host}/ws`);
    ws.onmessage = (event) => {
      const msg = JSON.parse(event.data);
      if (msg.type === 'stream_info') {
        const info = msg.data;
        document.getElementById('info').innerHTML =
          `<h2>${info.name}</h2><p>Type: ${info.type} | Channels: ${info.channel_count} | Rate: ${info.nominal_srate} Hz</p>`;
        channels.length = 0;
        for (let i = 0; i < info.channel_count; i++) channels.push({ x: [], y: [] });
      } else if (msg.type === 'sample') {
        msg.data.sample_data.forEach((v, i) => {
          if (!channels[i]) channels[i] = { x: [], y: [] };
          channels[i].x.push(Number(msg.data.lsl_timestamp));
          channels[i].y.push(v);
          if (channels[i].x.length > HISTORY) { channels[i].x.shift(); channels[i].y.shift(); }
        });
        dirty = true;
      }
    };
    setInterval(() => {
      if (!dirty) return;
      dirty = false;
      const traces = channels.map((c, i) => ({ x: c.x, y: c.y, type: 'scatter', mode: 'lines', name: `channel_${i}` }));
      Plotly.react('plot', traces, { xaxis: { title: 'LSL time (s)' }, yaxis: { title: 'Amplitude' } });
    }, {{FRAME_MS}});
  </script>
</body>
</html>
"#;
