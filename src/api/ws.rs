// =============================================================================
// WebSocket Handler — realtime chart-frame push
// =============================================================================
//
// Clients connect to `/ws/realtime_charts` and receive one `ChartFrame` JSON
// object per text frame, pushed whenever `run_chart_assembler` recomputes an
// opportunity's series. The push/recv `tokio::select!` shape (Ping/Pong,
// Close, a registered-socket cleanup on disconnect) follows the teacher's
// original `api/ws.rs`; fan-out itself is delegated to `BroadcastHub` so a
// slow client never blocks delivery to the rest.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::StreamExt;
use tracing::{debug, info};

use crate::api::AppContext;

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

async fn handle_connection(socket: WebSocket, ctx: AppContext) {
    let (sender, mut receiver) = socket.split();
    let id = ctx.chart_hub.register(sender);
    info!(socket = %id, "realtime chart WebSocket connected");

    // The publish side runs entirely through `BroadcastHub::publish_json`,
    // driven by the chart assembler task; this loop only needs to drain
    // client frames so Ping/Close are observed and the socket is
    // deregistered on disconnect.
    loop {
        match receiver.next().await {
            Some(Ok(Message::Close(_))) => {
                info!(socket = %id, "close frame received");
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                continue;
            }
            Some(Err(e)) => {
                debug!(socket = %id, error = %e, "WebSocket receive error, disconnecting");
                break;
            }
            None => break,
        }
    }

    ctx.chart_hub.unregister(id);
    info!(socket = %id, "realtime chart WebSocket disconnected");
}
