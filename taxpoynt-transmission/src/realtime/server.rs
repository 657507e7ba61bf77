//! WebSocket endpoint for live transmission events.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use taxpoynt_common::{Signal, incoming, internal, outgoing};
use tokio::{net::TcpListener, sync::broadcast};

use super::StreamHub;
use crate::{config::StreamConfig, error::StreamError};

pub struct StreamServer {
    listener: TcpListener,
    router: Router,
}

impl StreamServer {
    /// Bind the stream listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn bind(config: &StreamConfig, hub: Arc<StreamHub>) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| StreamError::Bind {
                address: config.listen_address.clone(),
                source: e,
            })?;

        tracing::info!(address = %config.listen_address, "Stream server bound successfully");

        let router = Router::new()
            .route("/stream", get(upgrade))
            .with_state(hub);

        Ok(Self { listener, router })
    }

    /// Address actually bound, useful when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        self.listener
            .local_addr()
            .map_err(|e| StreamError::Server(e.to_string()))
    }

    /// Accept stream connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a runtime error.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), StreamError> {
        internal!("Stream server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                internal!("Stream server received shutdown signal");
            })
            .await
            .map_err(|e| StreamError::Server(e.to_string()))?;

        internal!("Stream server stopped");
        Ok(())
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<StreamHub>>) -> Response {
    ws.on_upgrade(move |socket| connection(socket, hub))
}

async fn connection(socket: WebSocket, hub: Arc<StreamHub>) {
    let (connection_id, mut outbound) = hub.register();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Evicted by the hub.
                    break;
                };
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(%connection_id, "Failed to encode stream frame: {e}");
                        continue;
                    }
                };
                outgoing!(level = TRACE, "{text}");
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        incoming!(level = TRACE, "{}", text.as_str());
                        if let Err(e) = hub.handle_client_message(connection_id, text.as_str()) {
                            tracing::debug!(%connection_id, "Ignoring malformed client frame: {e}");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        hub.touch(connection_id);
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_))) => hub.touch(connection_id),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                }
            }
        }
    }

    hub.unregister(connection_id);
}
