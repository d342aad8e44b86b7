//! Request handlers for the server endpoints

pub mod origin;
pub mod websocket;

use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::constants::{MAX_FRAME_SIZE, WS_PATH};
use crate::core::message_handler::MessageHandler;

pub use origin::validate_origin;
pub use websocket::handle_ws_client;

fn with_handler(
    handler: Arc<MessageHandler>,
) -> impl Filter<Extract = (Arc<MessageHandler>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&handler))
}

/// `/ws` upgrade behind the origin check, plus `/health`
pub fn routes(
    handler: Arc<MessageHandler>,
    config: &ServerConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let allowed_origins = Arc::new(config.allowed_origins.clone());
    let development_mode = config.development_mode;
    let outbound_buffer = config.outbound_buffer;

    let ws_route = warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::header::optional::<String>("origin"))
        .and(warp::ws())
        .and(with_handler(handler))
        .map(
            move |origin: Option<String>,
                  ws: warp::ws::Ws,
                  handler: Arc<MessageHandler>|
                  -> Box<dyn Reply> {
                if !validate_origin(origin.as_deref(), &allowed_origins, development_mode) {
                    return Box::new(warp::reply::with_status("Forbidden", StatusCode::FORBIDDEN));
                }
                Box::new(
                    ws.max_message_size(MAX_FRAME_SIZE)
                        .on_upgrade(move |socket| handle_ws_client(socket, handler, outbound_buffer)),
                )
            },
        );

    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "OK");

    ws_route.or(health_route)
}
