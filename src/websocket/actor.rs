use actix::{Actor, ActorContext, AsyncContext, Handler, Message, StreamHandler};
use actix_web_actors::ws::{self, CloseCode, CloseReason, WebsocketContext};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, SubscriptionError};
use crate::protocol::{CloseStatus, SubProtocol};
use crate::security::SecurityContext;
use crate::server::{ClientConnection, ClientProxy};

// Frames buffered between a client proxy and its socket
const OUTBOUND_BUFFER: usize = 100;

// Frames the subscription core asks the socket actor to write
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    Close(CloseStatus),
}

// ClientConnection backed by a socket actor. Frames go through a channel that the
// actor drains, so the actor is the only writer on the socket.
pub struct ActorConnection {
    protocol: SubProtocol,
    security: SecurityContext,
    outbound: mpsc::Sender<Outbound>,
}

impl ActorConnection {
    pub fn new(protocol: SubProtocol, security: SecurityContext) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            ActorConnection {
                protocol,
                security,
                outbound,
            },
            rx,
        )
    }
}

#[async_trait]
impl ClientConnection for ActorConnection {
    fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    fn security_context(&self) -> &SecurityContext {
        &self.security
    }

    async fn send_message(&self, text: String) -> Result<()> {
        self.outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| SubscriptionError::Send("socket is closed".into()))
    }

    async fn close(&self, status: CloseStatus) -> Result<()> {
        self.outbound
            .send(Outbound::Close(status))
            .await
            .map_err(|_| SubscriptionError::Connection("socket is already closed".into()))
    }
}

// WebSocket actor for one subscription client
pub struct Subscriber {
    pub id: String,
    client: Option<Arc<ClientProxy>>, // None when the server refused the connection
    outbound: Option<mpsc::Receiver<Outbound>>,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

impl Subscriber {
    pub fn new(client: Option<Arc<ClientProxy>>, outbound: mpsc::Receiver<Outbound>) -> Self {
        Subscriber {
            id: client
                .as_ref()
                .map(|c| c.id().to_string())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            client,
            outbound: Some(outbound),
            inbound: None,
        }
    }
}

impl Actor for Subscriber {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // Relay frames queued by the client proxy into this actor
        if let Some(mut outbound) = self.outbound.take() {
            let addr = ctx.address();
            tokio::spawn(async move {
                while let Some(frame) = outbound.recv().await {
                    if addr.send(frame).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Hand incoming text frames to the proxy one at a time, in arrival order
        if let Some(client) = self.client.clone() {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            self.inbound = Some(tx);
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    if let Err(e) = client.handle_text(&text).await {
                        warn!("Client {} message failed: {}", client.id(), e);
                    }
                    if client.is_closed() {
                        break;
                    }
                }
            });
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound.take();
        if let Some(client) = self.client.take() {
            client.dispose();
        }
        info!("WebSocket {} disconnected", self.id);
    }
}

impl StreamHandler<std::result::Result<ws::Message, ws::ProtocolError>> for Subscriber {
    fn handle(&mut self, msg: std::result::Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                if let Some(inbound) = &self.inbound {
                    if inbound.send(text.to_string()).is_err() {
                        ctx.stop();
                    }
                }
            }
            Ok(ws::Message::Binary(bin)) => {
                warn!("Ignoring {} byte binary frame from {}", bin.len(), self.id);
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by {}: {:?}", self.id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received continuation frame from {}: ignoring", self.id);
            }
            Err(e) => {
                warn!("WebSocket protocol error from {}: {:?}", self.id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for Subscriber {
    type Result = ();

    fn handle(&mut self, frame: Outbound, ctx: &mut Self::Context) {
        match frame {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close(status) => {
                debug!("Closing WebSocket {} with {}", self.id, status.code);
                ctx.close(Some(CloseReason {
                    code: CloseCode::from(status.code),
                    description: Some(status.reason),
                }));
                ctx.stop();
            }
        }
    }
}
