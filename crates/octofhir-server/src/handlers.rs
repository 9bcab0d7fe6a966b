use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use octofhir_api::{
    ApiError, ApiResponse, BinaryRendering, CapabilityStatement, ResponseFormat,
    binary_attachment, binary_payload, binary_resource, bundle_from_resources, is_fhir_json_body,
    negotiate_binary, negotiate_format, validate_content_type,
};
use octofhir_core::events::ResourceEvent;
use octofhir_subscriptions::{ChannelType, SubscriptionError};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::MutexGuard;

use crate::server::AppState;
use crate::storage::StoredResource;

const SUBSCRIPTION: &str = "Subscription";
const BINARY: &str = "Binary";

type Params = Query<HashMap<String, String>>;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
    active_subscriptions: usize,
    websocket_sessions: usize,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "OctoFHIR Subscriptions",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            active_subscriptions: state.engine.registry().active_count(),
            websocket_sessions: state.engine.sessions().total_sessions(),
        }),
    )
}

pub async fn metadata(
    State(state): State<AppState>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let format = negotiate_format(format_param(&params), &headers)?;
    let mut channels = vec![ChannelType::WebSocket.as_str(), ChannelType::RestHook.as_str()];
    if !state.engine.config().message.topics.is_empty() {
        channels.push(ChannelType::Message.as_str());
    }
    if state.engine.config().email.is_some() {
        channels.push(ChannelType::Email.as_str());
    }
    let version = state.config.fhir.version_number().unwrap_or("3.0.2");
    let statement = CapabilityStatement::server(version, &[BINARY, SUBSCRIPTION], &channels);
    Ok(ApiResponse::ok(statement).with_format(format).into_response())
}

// ---- CRUD & Search ----

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let format = negotiate_format(format_param(&params), &headers)?;
    let resource = if resource_type == BINARY {
        binary_body(&headers, &body)?
    } else {
        json_body(&headers, &body)?
    };

    if resource_type == SUBSCRIPTION {
        state.engine.validate(&resource).map_err(subscription_error)?;
    }

    let _admin = subscription_guard(&state, &resource_type).await;
    let stored = state.store.create(&resource_type, &resource)?;

    if resource_type == SUBSCRIPTION {
        if let Err(err) = state.engine.create(&stored.id, &stored.resource) {
            state.store.delete(&resource_type, &stored.id);
            return Err(subscription_error(err));
        }
    }

    publish_write(&state, &resource_type, &stored);
    Ok(write_response(&state, &resource_type, stored, format))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let resource = state
        .store
        .read(&resource_type, &id)
        .ok_or_else(|| ApiError::not_found(format!("{resource_type}/{id} not found")))?;

    if resource_type == BINARY {
        return match negotiate_binary(format_param(&params), &headers)? {
            BinaryRendering::Raw => binary_attachment(&resource),
            BinaryRendering::Resource(format) => Ok(resource_response(resource, format)),
        };
    }

    let format = negotiate_format(format_param(&params), &headers)?;
    let resource = with_live_status(&state, &resource_type, resource);
    Ok(resource_response(resource, format))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let format = negotiate_format(format_param(&params), &headers)?;
    let resource = if resource_type == BINARY {
        binary_body(&headers, &body)?
    } else {
        json_body(&headers, &body)?
    };

    if resource_type == SUBSCRIPTION {
        state.engine.validate(&resource).map_err(subscription_error)?;
    }

    let _admin = subscription_guard(&state, &resource_type).await;
    let stored = state.store.update(&resource_type, &id, &resource)?;

    if resource_type == SUBSCRIPTION {
        let result = if stored.created {
            state.engine.create(&stored.id, &stored.resource)
        } else {
            state.engine.update(&stored.id, &stored.resource)
        };
        result.map_err(subscription_error)?;
    }

    publish_write(&state, &resource_type, &stored);
    Ok(write_response(&state, &resource_type, stored, format))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let _admin = subscription_guard(&state, &resource_type).await;
    if state.store.delete(&resource_type, &id).is_none() {
        return Err(ApiError::not_found(format!("{resource_type}/{id} not found")));
    }
    if resource_type == SUBSCRIPTION {
        state.engine.delete(&id);
    }
    state
        .events
        .send_resource(ResourceEvent::deleted(resource_type, id));
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn search_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let format = negotiate_format(format_param(&params), &headers)?;
    let resources = state
        .store
        .search(&resource_type)
        .into_iter()
        .map(|resource| with_live_status(&state, &resource_type, resource))
        .collect();
    let bundle = bundle_from_resources(&state.config.base_url(), &resource_type, resources);
    Ok(ApiResponse::ok(bundle).with_format(format).into_response())
}

// ---- helpers ----

/// Held across the store write and the engine call of a `Subscription` write.
async fn subscription_guard<'a>(
    state: &'a AppState,
    resource_type: &str,
) -> Option<MutexGuard<'a, ()>> {
    if resource_type == SUBSCRIPTION {
        Some(state.subscription_admin.lock().await)
    } else {
        None
    }
}

fn format_param(params: &HashMap<String, String>) -> Option<&str> {
    params.get("_format").map(String::as_str)
}

fn check_resource_type(resource_type: &str) -> Result<(), ApiError> {
    let valid = resource_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
        && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ApiError::not_found(format!(
            "Unknown resource type '{resource_type}'"
        )))
    }
}

fn json_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, ApiError> {
    validate_content_type(headers)?;
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))
}

/// A FHIR JSON `Binary` is stored as-is; any other payload is wrapped.
fn binary_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if is_fhir_json_body(headers) {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            if value.get("resourceType").and_then(Value::as_str) == Some(BINARY) {
                binary_payload(&value)?;
                return Ok(value);
            }
        }
    }
    Ok(binary_resource(
        content_type.unwrap_or("application/octet-stream"),
        body,
    ))
}

fn publish_write(state: &AppState, resource_type: &str, stored: &StoredResource) {
    let event = if stored.created {
        ResourceEvent::created(resource_type, &stored.id, stored.resource.clone())
    } else {
        ResourceEvent::updated(resource_type, &stored.id, stored.resource.clone())
    }
    .with_version(stored.version_id as i64);

    let queued = state.engine.on_resource_written(&event);
    if queued > 0 {
        tracing::debug!(
            resource = %event.reference(),
            notifications = queued,
            "Subscription notifications queued"
        );
    }
    state.events.send_resource(event);
}

fn write_response(
    state: &AppState,
    resource_type: &str,
    stored: StoredResource,
    format: ResponseFormat,
) -> Response {
    let location = format!(
        "{}/{}/{}/_history/{}",
        state.config.base_url().trim_end_matches('/'),
        resource_type,
        stored.id,
        stored.version_id
    );
    let resource = with_live_status(state, resource_type, stored.resource);
    let mut response = if stored.created {
        ApiResponse::created(resource)
    } else {
        ApiResponse::ok(resource)
    }
    .with_format(format);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response = response.with_header(header::LOCATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("W/\"{}\"", stored.version_id)) {
        response = response.with_header(header::ETAG, value);
    }
    response.into_response()
}

fn resource_response(resource: Value, format: ResponseFormat) -> Response {
    let etag = resource
        .pointer("/meta/versionId")
        .and_then(Value::as_str)
        .and_then(|v| HeaderValue::from_str(&format!("W/\"{v}\"")).ok());
    let mut response = ApiResponse::ok(resource).with_format(format);
    if let Some(etag) = etag {
        response = response.with_header(header::ETAG, etag);
    }
    response.into_response()
}

/// Overlay the engine's view of a subscription (status and error text).
fn with_live_status(state: &AppState, resource_type: &str, mut resource: Value) -> Value {
    if resource_type != SUBSCRIPTION {
        return resource;
    }
    let Some(id) = resource.get("id").and_then(Value::as_str).map(str::to_string) else {
        return resource;
    };
    let Some((status, error)) = state.engine.status(&id) else {
        return resource;
    };
    if let Some(object) = resource.as_object_mut() {
        object.insert("status".into(), Value::String(status.as_str().to_string()));
        match error {
            Some(error) => {
                object.insert("error".into(), Value::String(error));
            }
            None => {
                object.remove("error");
            }
        }
    }
    resource
}

fn subscription_error(err: SubscriptionError) -> ApiError {
    match err {
        SubscriptionError::Validation(_) => ApiError::bad_request(err.to_string()),
        SubscriptionError::NotFound(_) => ApiError::not_found(err.to_string()),
        SubscriptionError::DuplicateId(_) | SubscriptionError::InvalidTransition { .. } => {
            ApiError::conflict(err.to_string())
        }
        SubscriptionError::Delivery(_) | SubscriptionError::Serialization(_) => {
            ApiError::internal(err.to_string())
        }
    }
}
