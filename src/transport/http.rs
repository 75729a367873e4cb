use std::io;
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::broker::long_poll::hold;
use crate::broker::message::{ConnectionType, Message};
use crate::broker::{Exchange, SharedBroker, lock};
use crate::config::ServerSettings;
use crate::transport::message::{MessageParams, render_jsonp, validate_callback};
use crate::utils::ProtocolError;

#[derive(Clone)]
struct AppState {
    broker: SharedBroker,
    poll_timeout: Duration,
}

/// Serves the Bayeux endpoint at `path` for both POST (form) and GET (query,
/// JSONP) exchanges.
pub fn router(broker: SharedBroker, path: &str) -> Router {
    let poll_timeout = lock(&broker).settings().poll_timeout();
    let state = AppState {
        broker,
        poll_timeout,
    };

    Router::new()
        .route(path, get(handle_get).post(handle_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, broker: SharedBroker, path: &str) -> io::Result<()> {
    axum::serve(listener, router(broker, path)).await
}

pub async fn start_http_server(settings: &ServerSettings, broker: SharedBroker) -> io::Result<()> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Bayeux server listening on http://{}{}", addr, settings.path);
    serve(listener, broker, &settings.path).await
}

async fn handle_post(State(state): State<AppState>, Form(params): Form<MessageParams>) -> Response {
    exchange(state, params).await
}

async fn handle_get(State(state): State<AppState>, Query(params): Query<MessageParams>) -> Response {
    exchange(state, params).await
}

async fn exchange(state: AppState, params: MessageParams) -> Response {
    if let Some(callback) = params.jsonp.as_deref() {
        if let Err(err) = validate_callback(callback) {
            return reject(err);
        }
    }
    let connection_type = match params.jsonp {
        Some(_) => ConnectionType::CallbackPolling,
        None => ConnectionType::LongPolling,
    };

    let messages = match params.messages() {
        Ok(messages) => messages,
        Err(err) => return reject(err),
    };

    let delivery = {
        let mut broker = lock(&state.broker);
        broker.deliver_all(messages, Exchange { connection_type })
    };
    let delivery = match delivery {
        Ok(delivery) => delivery,
        Err(err) => return reject(err),
    };

    let responses = match delivery.pending {
        Some(pending) => hold(state.broker.clone(), pending, state.poll_timeout).await,
        None => delivery.responses,
    };
    render(params.jsonp.as_deref(), &responses)
}

fn reject(err: ProtocolError) -> Response {
    let status = match err {
        ProtocolError::UnknownChannel(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    warn!(status = status.as_u16(), error = %err, "rejected exchange");
    (status, err.to_string()).into_response()
}

fn render(callback: Option<&str>, responses: &[Message]) -> Response {
    let Some(callback) = callback else {
        return Json(responses).into_response();
    };
    match render_jsonp(callback, responses) {
        Ok(body) => ([(header::CONTENT_TYPE, "text/javascript")], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
