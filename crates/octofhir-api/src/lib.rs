use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

pub const CT_FHIR_JSON: &str = "application/fhir+json";
pub const CT_FHIR_XML: &str = "application/fhir+xml";
const CT_FHIR_JSON_UTF8: &str = "application/fhir+json;charset=utf-8";
const CT_FHIR_XML_UTF8: &str = "application/fhir+xml;charset=utf-8";

/// Minimal FHIR OperationOutcome representation for API error responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationOutcome {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str, // always "OperationOutcome"
    pub issue: Vec<OperationOutcomeIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationOutcomeIssue {
    /// FHIR issue severity: fatal | error | warning | information
    pub severity: &'static str,
    /// FHIR issue type code (subset used): invalid | not-found | conflict | not-supported | exception
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl OperationOutcome {
    pub fn single(
        severity: &'static str,
        code: &'static str,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: "OperationOutcome",
            issue: vec![OperationOutcomeIssue {
                severity,
                code,
                diagnostics: Some(diagnostics.into()),
            }],
        }
    }
}

/// High-level API errors mapped to HTTP responses and FHIR OperationOutcome
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        Self::NotAcceptable(msg.into())
    }
    pub fn unsupported_media_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedMediaType(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_operation_outcome(&self) -> OperationOutcome {
        match self {
            ApiError::BadRequest(msg) => OperationOutcome::single("error", "invalid", msg),
            ApiError::NotFound(msg) => OperationOutcome::single("error", "not-found", msg),
            ApiError::Conflict(msg) => OperationOutcome::single("error", "conflict", msg),
            ApiError::NotAcceptable(msg) | ApiError::UnsupportedMediaType(msg) => {
                OperationOutcome::single("error", "not-supported", msg)
            }
            ApiError::Internal(msg) => OperationOutcome::single("fatal", "exception", msg),
        }
    }
}

impl From<octofhir_core::CoreError> for ApiError {
    fn from(err: octofhir_core::CoreError) -> Self {
        use octofhir_core::ErrorCategory;
        match err.category() {
            ErrorCategory::Validation | ErrorCategory::Serialization => {
                ApiError::bad_request(err.to_string())
            }
            ErrorCategory::NotFound => ApiError::not_found(err.to_string()),
            ErrorCategory::Conflict => ApiError::conflict(err.to_string()),
            ErrorCategory::Configuration => ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::to_vec(&self.to_operation_outcome()).unwrap_or_else(|_| b"{}".to_vec());
        (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static(CT_FHIR_JSON_UTF8))],
            body,
        )
            .into_response()
    }
}


// -------------------------
// Content Negotiation
// -------------------------

/// Encoding of a structured FHIR response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
}

impl ResponseFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseFormat::Json => CT_FHIR_JSON_UTF8,
            ResponseFormat::Xml => CT_FHIR_XML_UTF8,
        }
    }

    /// Map a `_format` value (`json`, `xml` or a mime type).
    pub fn from_format_param(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        let mime = value.split(';').next().unwrap_or_default().trim();
        match mime {
            "json" | "application/json" | "application/fhir+json" | "application/json+fhir" => {
                Some(ResponseFormat::Json)
            }
            "xml" | "text/xml" | "application/xml" | "application/fhir+xml"
            | "application/xml+fhir" => Some(ResponseFormat::Xml),
            _ => None,
        }
    }

    fn from_media_type(media: &str) -> Option<Self> {
        match media {
            "application/fhir+json" | "application/json+fhir" | "application/json" => {
                Some(ResponseFormat::Json)
            }
            "application/fhir+xml" | "application/xml+fhir" | "application/xml" | "text/xml" => {
                Some(ResponseFormat::Xml)
            }
            _ => None,
        }
    }

    pub fn encode(&self, value: &JsonValue) -> Result<Vec<u8>, ApiError> {
        match self {
            ResponseFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ApiError::internal(e.to_string()))
            }
            ResponseFormat::Xml => octofhir_core::to_fhir_xml(value)
                .map(String::into_bytes)
                .map_err(|e| ApiError::internal(e.to_string())),
        }
    }
}

/// One entry of an `Accept` header.
struct MediaRange {
    media: String,
    quality: f32,
}

fn accept_ranges(headers: &HeaderMap) -> Vec<MediaRange> {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    accept
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let mut pieces = part.split(';');
            let media = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
            let quality = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            MediaRange { media, quality }
        })
        .collect()
}

/// Choose the response encoding: `_format` beats `Accept`, JSON is the default.
///
/// An unsupported `_format` is rejected; an `Accept` header without a FHIR
/// type falls back to JSON.
pub fn negotiate_format(
    format_param: Option<&str>,
    headers: &HeaderMap,
) -> Result<ResponseFormat, ApiError> {
    if let Some(value) = format_param {
        return ResponseFormat::from_format_param(value).ok_or_else(|| {
            ApiError::not_acceptable(format!("Unsupported _format '{value}'"))
        });
    }

    let mut best: Option<(ResponseFormat, f32)> = None;
    for range in accept_ranges(headers) {
        let Some(format) = ResponseFormat::from_media_type(&range.media) else {
            continue;
        };
        if range.quality > 0.0 && best.is_none_or(|(_, q)| range.quality > q) {
            best = Some((format, range.quality));
        }
    }
    Ok(best.map(|(format, _)| format).unwrap_or_default())
}

/// How a `Binary` resource is returned on a plain read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryRendering {
    /// Raw bytes with the declared content type and an attachment disposition
    Raw,
    Resource(ResponseFormat),
}

const FHIR_MEDIA_TYPES: &[&str] = &[
    "application/fhir+json",
    "application/fhir+xml",
    "application/json+fhir",
    "application/xml+fhir",
];

/// Structured output only when the client asks for FHIR explicitly; browsers
/// and clients without `Accept` get the raw payload as an attachment.
pub fn negotiate_binary(
    format_param: Option<&str>,
    headers: &HeaderMap,
) -> Result<BinaryRendering, ApiError> {
    let explicit_fhir = accept_ranges(headers)
        .iter()
        .any(|range| range.quality > 0.0 && FHIR_MEDIA_TYPES.contains(&range.media.as_str()));
    if format_param.is_some() || explicit_fhir {
        negotiate_format(format_param, headers).map(BinaryRendering::Resource)
    } else {
        Ok(BinaryRendering::Raw)
    }
}

/// Validate Content-Type for structured request bodies.
pub fn validate_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        let val = ct.to_str().unwrap_or("").to_ascii_lowercase();
        let allowed =
            val.starts_with("application/fhir+json") || val.starts_with("application/json");
        if !allowed {
            return Err(ApiError::unsupported_media_type(format!(
                "Unsupported Content-Type: {val}. Only application/fhir+json or application/json are supported."
            )));
        }
    }
    Ok(())
}

/// Whether a request body should be parsed as a FHIR JSON resource.
pub fn is_fhir_json_body(headers: &HeaderMap) -> bool {
    validate_content_type(headers).is_ok()
}

#[cfg(test)]
mod content_negotiation_tests {
    use super::*;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn format_param_beats_accept() {
        let headers = accept("application/fhir+json");
        assert_eq!(
            negotiate_format(Some("xml"), &headers).unwrap(),
            ResponseFormat::Xml
        );
        assert_eq!(
            negotiate_format(Some("application/fhir+json"), &HeaderMap::new()).unwrap(),
            ResponseFormat::Json
        );
        let err = negotiate_format(Some("yaml"), &headers).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_ACCEPTABLE);
    }

    #[test]
    fn accept_header_selects_by_quality() {
        assert_eq!(
            negotiate_format(None, &accept("application/fhir+xml")).unwrap(),
            ResponseFormat::Xml
        );
        assert_eq!(
            negotiate_format(
                None,
                &accept("application/fhir+xml;q=0.5, application/fhir+json")
            )
            .unwrap(),
            ResponseFormat::Json
        );
        assert_eq!(
            negotiate_format(None, &accept("text/html")).unwrap(),
            ResponseFormat::Json
        );
        assert_eq!(
            negotiate_format(None, &HeaderMap::new()).unwrap(),
            ResponseFormat::Json
        );
    }

    #[test]
    fn binary_raw_without_explicit_fhir_accept() {
        assert_eq!(
            negotiate_binary(None, &HeaderMap::new()).unwrap(),
            BinaryRendering::Raw
        );
        let browser = accept("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8");
        assert_eq!(negotiate_binary(None, &browser).unwrap(), BinaryRendering::Raw);
    }

    #[test]
    fn binary_structured_when_requested() {
        assert_eq!(
            negotiate_binary(None, &accept("application/fhir+json")).unwrap(),
            BinaryRendering::Resource(ResponseFormat::Json)
        );
        assert_eq!(
            negotiate_binary(None, &accept("application/xml+fhir")).unwrap(),
            BinaryRendering::Resource(ResponseFormat::Xml)
        );
        assert_eq!(
            negotiate_binary(Some("xml"), &HeaderMap::new()).unwrap(),
            BinaryRendering::Resource(ResponseFormat::Xml)
        );
    }

    #[test]
    fn content_type_allows_json_variants() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json; charset=UTF-8"),
        );
        assert!(validate_content_type(&headers).is_ok());
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("foo/bar"));
        assert_eq!(
            validate_content_type(&headers).unwrap_err().status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert!(!is_fhir_json_body(&headers));
    }
}

// -------------------------
// API Response Wrapper
// -------------------------

/// A structured FHIR response encoded in the negotiated format.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub status: StatusCode,
    pub format: ResponseFormat,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl<T> ApiResponse<T> {
    pub fn new(value: T, status: StatusCode) -> Self {
        Self {
            value,
            status,
            format: ResponseFormat::Json,
            headers: Vec::new(),
        }
    }

    pub fn ok(value: T) -> Self {
        Self::new(value, StatusCode::OK)
    }

    pub fn created(value: T) -> Self {
        Self::new(value, StatusCode::CREATED)
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = serde_json::to_value(&self.value)
            .map_err(|e| ApiError::internal(e.to_string()))
            .and_then(|value| self.format.encode(&value));
        let body = match body {
            Ok(body) => body,
            Err(e) => return e.into_response(),
        };

        let mut response = (
            self.status,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(self.format.content_type()),
            )],
            body,
        )
            .into_response();
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            headers.insert(name, value);
        }
        response
    }
}


// -------------------------
// Binary
// -------------------------

/// Build a `Binary` resource around raw bytes.
pub fn binary_resource(content_type: &str, bytes: &[u8]) -> JsonValue {
    json!({
        "resourceType": "Binary",
        "contentType": content_type,
        "content": BASE64.encode(bytes),
    })
}

/// Declared content type and decoded bytes of a `Binary` resource.
///
/// Reads the DSTU2/3 `content` element, falling back to R4 `data`.
pub fn binary_payload(resource: &JsonValue) -> Result<(String, Vec<u8>), ApiError> {
    let content_type = resource
        .get("contentType")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ApiError::bad_request("Binary.contentType is required"))?;
    let data = resource
        .get("content")
        .or_else(|| resource.get("data"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let bytes = BASE64
        .decode(data)
        .map_err(|e| ApiError::bad_request(format!("Binary data is not valid base64: {e}")))?;
    Ok((content_type.to_string(), bytes))
}

/// Raw `Binary` response: declared content type plus an attachment disposition.
pub fn binary_attachment(resource: &JsonValue) -> Result<Response, ApiError> {
    let (content_type, bytes) = binary_payload(resource)?;
    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("Attachment;"),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod binary_tests {
    use super::*;

    #[test]
    fn binary_resource_encodes_base64() {
        let resource = binary_resource("foo/bar", &[1, 2, 3, 4]);
        assert_eq!(resource["content"], "AQIDBA==");
        let (content_type, bytes) = binary_payload(&resource).unwrap();
        assert_eq!(content_type, "foo/bar");
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn binary_payload_reads_r4_data_element() {
        let resource = json!({"resourceType": "Binary", "contentType": "text/plain", "data": "AQIDBA=="});
        assert_eq!(binary_payload(&resource).unwrap().1, vec![1, 2, 3, 4]);
        let missing = json!({"resourceType": "Binary"});
        assert!(binary_payload(&missing).is_err());
    }

    #[test]
    fn attachment_sets_disposition() {
        let resp = binary_attachment(&binary_resource("foo", &[1, 2, 3, 4])).unwrap();
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "foo");
        assert_eq!(
            resp.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "Attachment;"
        );
    }
}

// -------------------------
// FHIR Bundle Types
// -------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "fullUrl")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
}

/// Search component of a Bundle entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleEntrySearch {
    /// "match" for search results
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str,
    #[serde(rename = "type")]
    pub bundle_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link: Vec<BundleLink>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn searchset(total: u64, entries: Vec<BundleEntry>, links: Vec<BundleLink>) -> Self {
        Self {
            resource_type: "Bundle",
            bundle_type: "searchset".to_string(),
            total: Some(total),
            link: links,
            entry: entries,
        }
    }
}

/// Searchset over all resources of one type.
pub fn bundle_from_resources(
    base_url: &str,
    resource_type: &str,
    resources: Vec<JsonValue>,
) -> Bundle {
    let base = base_url.trim_end_matches('/');
    let entries: Vec<BundleEntry> = resources
        .into_iter()
        .map(|resource| {
            let full_url = resource
                .get("id")
                .and_then(JsonValue::as_str)
                .map(|id| format!("{base}/{resource_type}/{id}"));
            BundleEntry {
                full_url,
                resource: Some(resource),
                search: Some(BundleEntrySearch {
                    mode: "match".into(),
                }),
            }
        })
        .collect();
    let links = vec![BundleLink {
        relation: "self".into(),
        url: format!("{base}/{resource_type}"),
    }];
    Bundle::searchset(entries.len() as u64, entries, links)
}


// -------------------------
// CapabilityStatement Types
// -------------------------
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityStatement {
    #[serde(rename = "resourceType")]
    pub resource_type: &'static str, // always "CapabilityStatement"
    pub status: String,
    pub kind: String,
    #[serde(rename = "fhirVersion")]
    pub fhir_version: String,
    pub format: Vec<String>,
    pub rest: Vec<CapabilityStatementRest>,
}

impl CapabilityStatement {
    /// Server statement listing the supported resource types and channel types.
    pub fn server(fhir_version: &str, resource_types: &[&str], channel_types: &[&str]) -> Self {
        let resource = resource_types
            .iter()
            .map(|t| {
                CapabilityStatementRestResource::new(*t).with_interactions(&[
                    "read",
                    "create",
                    "update",
                    "delete",
                    "search-type",
                ])
            })
            .collect();
        let documentation = (!channel_types.is_empty())
            .then(|| format!("Subscription channels: {}", channel_types.join(", ")));
        Self {
            resource_type: "CapabilityStatement",
            status: "active".to_string(),
            kind: "instance".to_string(),
            fhir_version: fhir_version.to_string(),
            format: vec![CT_FHIR_JSON.to_string(), CT_FHIR_XML.to_string()],
            rest: vec![CapabilityStatementRest {
                mode: "server".to_string(),
                documentation,
                resource,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityStatementRest {
    pub mode: String, // "server" or "client"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub resource: Vec<CapabilityStatementRestResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityStatementRestResource {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub interaction: Vec<ResourceInteraction>,
}

impl CapabilityStatementRestResource {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_: type_name.into(),
            interaction: Vec::new(),
        }
    }

    pub fn with_interactions(mut self, codes: &[&str]) -> Self {
        self.interaction = codes
            .iter()
            .map(|c| ResourceInteraction {
                code: c.to_string(),
            })
            .collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceInteraction {
    pub code: String, // e.g., "read", "search-type", "create"
}

#[cfg(test)]
mod capability_statement_tests {
    use super::*;

    #[test]
    fn serialize_server_capability_statement() {
        let cs = CapabilityStatement::server("3.0.2", &["Subscription", "Binary"], &["websocket"]);
        let j = serde_json::to_value(&cs).unwrap();
        assert_eq!(j["resourceType"], "CapabilityStatement");
        assert_eq!(j["fhirVersion"], "3.0.2");
        assert!(
            j["format"]
                .as_array()
                .unwrap()
                .iter()
                .any(|v| v == "application/fhir+xml")
        );
        assert_eq!(j["rest"][0]["mode"], "server");
        assert_eq!(j["rest"][0]["resource"][1]["type"], "Binary");
        let interactions = j["rest"][0]["resource"][0]["interaction"].as_array().unwrap();
        assert!(interactions.iter().any(|v| v["code"] == "search-type"));
        assert_eq!(j["rest"][0]["documentation"], "Subscription channels: websocket");
    }
}
