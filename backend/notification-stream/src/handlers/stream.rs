/// HTTP surface of the notification stream service
///
/// Clients open a long-lived `text/event-stream` response; internal
/// producers push notifications through the POST routes. Authentication
/// happens upstream: the gateway injects the caller identity headers.
use actix_web::{
    http::header::{HeaderMap, CACHE_CONTROL},
    web, HttpRequest, HttpResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::models::Notification;
use crate::stream::{NotificationStreamEvent, StreamService};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Header carrying the caller's organization, if any
pub const ORGANIZATION_ID_HEADER: &str = "X-Organization-Id";

/// Body of `POST /users/{user_id}/events`
#[derive(Debug, Deserialize)]
pub struct StreamEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl From<StreamEventRequest> for NotificationStreamEvent {
    fn from(request: StreamEventRequest) -> Self {
        let mut event = NotificationStreamEvent::new(request.event_type, request.data);
        if let Some(id) = request.id {
            event = event.with_id(id);
        }
        if let Some(retry) = request.retry {
            event = event.with_retry(retry);
        }
        event
    }
}

#[derive(Debug, Serialize)]
pub struct StreamStats {
    pub total_connections: usize,
    pub connected_users: usize,
    pub user_ids: Vec<String>,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Open a notification stream for the calling user
///
/// Endpoint: GET /api/v1/notifications/stream
pub async fn open_stream(
    req: HttpRequest,
    service: web::Data<StreamService>,
) -> Result<HttpResponse> {
    let user_id = header_value(req.headers(), USER_ID_HEADER).ok_or(AppError::Unauthorized)?;
    let organization_id = header_value(req.headers(), ORGANIZATION_ID_HEADER);

    let (_connection, body) = service.create_stream(user_id, organization_id)?;

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body))
}

/// Endpoint: POST /api/v1/notifications/stream/users/{user_id}
pub async fn notify_user(
    path: web::Path<String>,
    service: web::Data<StreamService>,
    body: web::Json<Notification>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let report = service.send_notification_to_user(&user_id, &body);
    Ok(HttpResponse::Ok().json(report))
}

/// Endpoint: POST /api/v1/notifications/stream/organizations/{organization_id}
pub async fn notify_organization(
    path: web::Path<String>,
    service: web::Data<StreamService>,
    body: web::Json<Notification>,
) -> Result<HttpResponse> {
    let organization_id = path.into_inner();
    let report = service.send_notification_to_organization(&organization_id, &body);
    Ok(HttpResponse::Ok().json(report))
}

/// Endpoint: POST /api/v1/notifications/stream/broadcast
pub async fn broadcast(
    service: web::Data<StreamService>,
    body: web::Json<Notification>,
) -> Result<HttpResponse> {
    let report = service.broadcast_notification(&body);
    Ok(HttpResponse::Ok().json(report))
}

/// Endpoint: POST /api/v1/notifications/stream/users/{user_id}/events
pub async fn send_user_event(
    path: web::Path<String>,
    service: web::Data<StreamService>,
    body: web::Json<StreamEventRequest>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let event = NotificationStreamEvent::from(body.into_inner());
    let report = service.send_event_to_user(&user_id, &event);
    Ok(HttpResponse::Ok().json(report))
}

/// Endpoint: GET /api/v1/notifications/stream/stats
pub async fn stream_stats(service: web::Data<StreamService>) -> Result<HttpResponse> {
    let user_ids = service.connected_user_ids();
    Ok(HttpResponse::Ok().json(StreamStats {
        total_connections: service.connected_clients_count(),
        connected_users: user_ids.len(),
        user_ids,
    }))
}

/// Endpoint: GET /api/v1/notifications/stream/users/{user_id}
pub async fn user_status(
    path: web::Path<String>,
    service: web::Data<StreamService>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let connection_count = service.user_clients_count(&user_id);

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "connected": connection_count > 0,
        "connection_count": connection_count,
    })))
}

/// Endpoint: DELETE /api/v1/notifications/stream/users/{user_id}
pub async fn disconnect_user(
    path: web::Path<String>,
    service: web::Data<StreamService>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let closed = service.disconnect_user(&user_id);

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "closed": closed,
    })))
}

/// Register notification stream routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/notifications/stream")
            .route("", web::get().to(open_stream))
            .route("/stats", web::get().to(stream_stats))
            .route("/broadcast", web::post().to(broadcast))
            .route(
                "/organizations/{organization_id}",
                web::post().to(notify_organization),
            )
            .route("/users/{user_id}", web::post().to(notify_user))
            .route("/users/{user_id}", web::get().to(user_status))
            .route("/users/{user_id}", web::delete().to(disconnect_user))
            .route("/users/{user_id}/events", web::post().to(send_user_event)),
    );
}
