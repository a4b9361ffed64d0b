use crate::error::AppError;
use crate::middleware::guards;
use crate::state::AppState;
use crate::websocket::handlers::handle_client_event;
use crate::websocket::{ClientEvent, ConnectionId, LiveAttachment, ServerEvent};
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse, ResponseError};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// Frame headed to the client, from presence or from a handled event
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Outbound(String);

// WebSocket Actor
struct WsSession {
    user_id: Uuid,
    connection_id: ConnectionId,
    first_connection: bool,
    outbound: Option<UnboundedReceiver<String>>,
    hb: Instant,
    state: AppState,
}

impl WsSession {
    fn new(user_id: Uuid, attachment: LiveAttachment, state: AppState) -> Self {
        Self {
            user_id,
            connection_id: attachment.connection_id,
            first_connection: attachment.first_connection,
            outbound: Some(attachment.receiver),
            hb: Instant::now(),
            state,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(user_id = %act.user_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_event(ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(frame) => ctx.text(frame),
            Err(e) => tracing::error!(error = %e, "failed to encode frame"),
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = ?self.connection_id,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx).map(Outbound));
        }

        if self.first_connection {
            let state = self.state.clone();
            let user_id = self.user_id;
            actix::spawn(async move {
                if let Err(e) = state.messaging.announce_status(user_id, true).await {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to announce online");
                }
            });
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, "WebSocket session stopped");

        let state = self.state.clone();
        let user_id = self.user_id;
        let connection_id = self.connection_id;
        actix::spawn(async move {
            if state.live.detach(user_id, connection_id).await {
                if let Err(e) = state.messaging.announce_status(user_id, false).await {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to announce offline");
                }
            }
        });
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Outbound> for WsSession {
    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(evt) => {
                    let state = self.state.clone();
                    let user_id = self.user_id;
                    let addr = ctx.address();
                    actix::spawn(async move {
                        if let Some(reply) = handle_client_event(&state, user_id, evt).await {
                            match serde_json::to_string(&reply) {
                                Ok(frame) => addr.do_send(Outbound(frame)),
                                Err(e) => tracing::error!(error = %e, "failed to encode reply"),
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(user_id = %self.user_id, error = %e, "Failed to parse WS message");
                    Self::send_event(
                        ctx,
                        &ServerEvent::error(&AppError::BadRequest(format!("unreadable frame: {e}"))),
                    );
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let user = match guards::authenticate(&req) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket connection rejected");
            return Ok(e.error_response());
        }
    };

    let attachment = state.live.attach(user.id).await;
    let connection_id = attachment.connection_id;
    let session = WsSession::new(user.id, attachment, state.get_ref().clone());

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state.live.detach(user.id, connection_id).await;
            Err(e)
        }
    }
}
