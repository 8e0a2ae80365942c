use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, Route, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::backend::GpioBackend;
use crate::config::{Direction, Edge};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioManager};

pub struct AppState<B: GpioBackend> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct EdgeDetectPayload {
    edge: Edge,
}

#[derive(Deserialize)]
struct WaitPayload {
    edge: Edge,
    timeout_ms: Option<u64>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    line_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if line_filter.is_none_or(|line| line == event.line) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if session.text(text).await.is_err() {
                                    warn!("WebSocket client disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let lagged = AppError::Runtime(format!("Event stream lagged by {n} messages"));
                        if session.text(lagged.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn only(methods: &[Method]) -> Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

pub fn api_scope<B: GpioBackend + 'static>(base_path: &str) -> actix_web::Scope {
    web::scope(base_path)
        .service(
            web::resource("/lines")
                .route(web::get().to(list_lines::<B>))
                .route(only(&[Method::GET])),
        )
        .service(
            web::resource("/lines/events")
                .route(web::get().to(events_ws_all::<B>))
                .route(only(&[Method::GET])),
        )
        .service(
            web::resource("/line/{line}")
                .route(web::get().to(line_descriptor::<B>))
                .route(only(&[Method::GET])),
        )
        .service(
            web::resource("/line/{line}/export")
                .route(web::post().to(export_line::<B>))
                .route(only(&[Method::POST])),
        )
        .service(
            web::resource("/line/{line}/unexport")
                .route(web::post().to(unexport_line::<B>))
                .route(only(&[Method::POST])),
        )
        .service(
            web::resource("/line/{line}/direction")
                .route(web::get().to(get_direction::<B>))
                .route(web::post().to(set_direction::<B>))
                .route(only(&[Method::GET, Method::POST])),
        )
        .service(
            web::resource("/line/{line}/value")
                .route(web::get().to(get_value::<B>))
                .route(web::post().to(set_value::<B>))
                .route(only(&[Method::GET, Method::POST])),
        )
        .service(
            web::resource("/line/{line}/edge-detect")
                .route(web::post().to(add_edge_detect::<B>))
                .route(web::delete().to(remove_edge_detect::<B>))
                .route(only(&[Method::POST, Method::DELETE])),
        )
        .service(
            web::resource("/line/{line}/event")
                .route(web::get().to(event_detected::<B>))
                .route(only(&[Method::GET])),
        )
        .service(
            web::resource("/line/{line}/events")
                .route(web::get().to(events_ws_line::<B>))
                .route(only(&[Method::GET])),
        )
        .service(
            web::resource("/line/{line}/wait")
                .route(web::post().to(wait_for_edge::<B>))
                .route(only(&[Method::POST])),
        )
}

async fn list_lines<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let lines = state.manager.list_lines().await;

    Ok(web::Json(lines))
}

async fn line_descriptor<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let desc = state.manager.get_line_descriptor(line).await?;

    Ok(web::Json(desc))
}

async fn export_line<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    state.manager.export(line).await?;

    Ok(HttpResponse::Ok())
}

async fn unexport_line<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    state.manager.unexport(line).await?;

    Ok(HttpResponse::Ok())
}

async fn get_direction<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let direction = state.manager.get_direction(line).await?;

    Ok(web::Json(direction))
}

async fn set_direction<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let direction: Direction = parse_text_payload(&body, "direction")?
        .parse()
        .map_err(|v| AppError::InvalidValue(format!("Unknown direction {v:?}")))?;

    state.manager.set_direction(line, direction).await?;

    Ok(HttpResponse::Ok())
}

async fn get_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;

    let value = state.manager.read_value(line).await?;

    Ok(web::Json(value))
}

async fn set_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let value = parse_text_payload(&body, "value")?
        .parse::<u8>()
        .map_err(|_| AppError::InvalidValue("Value must be an integer".into()))?;

    state.manager.write_value(line, value).await?;

    Ok(HttpResponse::Ok())
}

async fn add_edge_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let payload: EdgeDetectPayload = parse_json_payload(&body, "edge detect")?;

    let outcome = state.manager.enable_edge_detect(line, payload.edge)?;

    Ok(HttpResponse::Ok().json(json!({ "outcome": outcome })))
}

async fn remove_edge_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    state.manager.disable_edge_detect(line).await?;

    Ok(HttpResponse::Ok())
}

async fn event_detected<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let detected = state.manager.event_detected(line).await?;

    Ok(web::Json(detected))
}

async fn wait_for_edge<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line = parse_line(&req)?;
    let payload: WaitPayload = parse_json_payload(&body, "wait")?;

    let outcome = state
        .manager
        .wait_for_edge(line, payload.edge, payload.timeout_ms)
        .await?;

    Ok(web::Json(outcome))
}

async fn events_ws_all<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    start_event_websocket(&req, stream, &state, None)
}

async fn events_ws_line<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let line = parse_line(&req)?;
    state.manager.get_line_descriptor(line).await?;

    start_event_websocket(&req, stream, &state, Some(line))
}

fn start_event_websocket<B: GpioBackend + 'static>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    line_filter: Option<u32>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::Runtime(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, line_filter).await;
    });

    Ok(response)
}

fn parse_text_payload<'a>(body: &'a [u8], what: &str) -> Result<&'a str, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    std::str::from_utf8(body)
        .map(str::trim)
        .map_err(|_| AppError::InvalidValue(format!("{what} payload must be valid UTF-8")))
}

fn parse_json_payload<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid {what} payload: {e}")))
}

fn parse_line(req: &HttpRequest) -> Result<u32, AppError> {
    let line = req
        .match_info()
        .get("line")
        .ok_or_else(|| AppError::InvalidValue("Missing line number".into()))?;
    let line = line
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid line number".into()))?;

    Ok(line)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
