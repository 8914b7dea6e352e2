//! The browser-facing WebSocket actor (§4.7/§4.8). One actor per connection,
//! wrapping a [`Supervisor`] and translating between `actix-web-actors`'
//! `ws::Message` stream and the JSON/binary envelope the supervisor speaks.
//!
//! Downlink backpressure (§4.7) is tracked as a shared byte counter: the
//! supervisor increments it when it hands a voice frame to the outbox and
//! drops frames once it crosses 2MB, and this actor decrements it once a
//! frame is actually written to the socket. Control messages never count
//! against the limit and are never dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web_actors::ws;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::peer::protocol::{GatewayMessage, PeerMessage};
use crate::supervisor::{Outbound, Supervisor};

pub struct GatewaySocket {
    inbox_tx: mpsc::Sender<PeerCommand>,
    outbox_rx: Option<mpsc::Receiver<Outbound>>,
    downlink_pending_bytes: Arc<AtomicUsize>,
}

enum PeerCommand {
    Message(PeerMessage),
    UplinkVoice(crate::peer::protocol::UplinkVoiceFrame),
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Push(Outbound);

impl GatewaySocket {
    pub fn new(whitelist: std::sync::Arc<crate::config::Whitelist>, config: crate::config::GatewayConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel::<PeerCommand>(256);
        let (outbox_tx, outbox_rx) = mpsc::channel::<Outbound>(256);
        let downlink_pending_bytes = Arc::new(AtomicUsize::new(0));

        let supervisor = Supervisor::new(whitelist, config, outbox_tx, downlink_pending_bytes.clone());
        tokio::spawn(drive_supervisor(supervisor, inbox_rx));

        GatewaySocket { inbox_tx, outbox_rx: Some(outbox_rx), downlink_pending_bytes }
    }
}

impl Actor for GatewaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(outbox_rx) = self.outbox_rx.take() {
            tokio::spawn(forward_outbox(outbox_rx, ctx.address()));
        }
    }
}

async fn forward_outbox(mut outbox_rx: mpsc::Receiver<Outbound>, addr: actix::Addr<GatewaySocket>) {
    while let Some(out) = outbox_rx.recv().await {
        if addr.send(Push(out)).await.is_err() {
            return;
        }
    }
}

async fn drive_supervisor(mut supervisor: Supervisor, mut inbox_rx: mpsc::Receiver<PeerCommand>) {
    supervisor.send_server_list().await;

    while let Some(cmd) = inbox_rx.recv().await {
        match cmd {
            PeerCommand::Message(PeerMessage::Connect { server_id, username, password, tokens }) => {
                supervisor.handle_connect(server_id, username, password, tokens).await;
            }
            PeerCommand::Message(PeerMessage::Disconnect) => supervisor.handle_disconnect().await,
            PeerCommand::Message(PeerMessage::JoinChannel { channel_id }) => supervisor.handle_join_channel(channel_id).await,
            PeerCommand::Message(PeerMessage::TextSend { message, channel_id, user_id }) => {
                supervisor.handle_text_send(message, channel_id, user_id).await;
            }
            PeerCommand::Message(PeerMessage::Ping { client_time_ms }) => supervisor.handle_ping(client_time_ms).await,
            PeerCommand::UplinkVoice(frame) => supervisor.handle_uplink_voice(frame).await,
        }
    }
    supervisor.handle_disconnect().await;
}

impl Handler<Push> for GatewaySocket {
    type Result = ();

    fn handle(&mut self, msg: Push, ctx: &mut Self::Context) {
        match msg.0 {
            Outbound::Json(gateway_message) => match serde_json::to_string(&gateway_message) {
                Ok(text) => ctx.text(text),
                Err(e) => tracing::warn!("failed to serialize outbound message: {e}"),
            },
            Outbound::Binary(bytes) => {
                // The supervisor already applied the 2MB backpressure check
                // before enqueueing this frame; once it's here, actually
                // writing it clears that many bytes back off the counter.
                self.downlink_pending_bytes.fetch_sub(bytes.len(), Ordering::Relaxed);
                ctx.binary(bytes);
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for GatewaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Text(text) => match serde_json::from_str::<PeerMessage>(&text) {
                Ok(parsed) => {
                    let tx = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(PeerCommand::Message(parsed)).await;
                    });
                }
                Err(e) => {
                    tracing::debug!("dropping malformed peer message: {e}");
                    let error = GatewayMessage::Error {
                        code: ErrorCode::BadRequest.as_str(),
                        message: "malformed or unknown peer message".to_string(),
                        details: Some(e.to_string()),
                    };
                    if let Ok(text) = serde_json::to_string(&error) {
                        ctx.text(text);
                    }
                }
            },
            ws::Message::Binary(bytes) => {
                if let Some(frame) = crate::peer::protocol::decode_uplink_frame(&bytes) {
                    let tx = self.inbox_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(PeerCommand::UplinkVoice(frame)).await;
                    });
                }
            }
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }
}
