// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
    header::{self, HeaderValue},
    http::{self, HeaderMap},
    Request, Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

pub type Body = BoxBody<Bytes, hyper::Error>;
pub type HttpRequest = Request<Body>;
pub type HttpResponse = Response<Full<Bytes>>;

const CORS_ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const CORS_ALLOWED_HEADERS: &str = "Content-Type";

/// Wraps an in-memory payload as a request body.
pub fn body_from(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Does two things:
/// 1. Logs the given message. Server errors (5xx) are logged at error level, anything else at
///    debug level.
/// 2. Returns the given message in the body of a JSON response with the given status code.
///
/// Response body format:
/// {
///     "error": message
/// }
pub fn log_and_create_error_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!("{message}");
    } else {
        debug!("{message}");
    }
    let body = json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Serializes `payload` as the JSON body of a response with the given status code.
pub fn create_json_response<T: Serialize>(
    payload: &T,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    match serde_json::to_vec(payload) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body))),
        Err(err) => log_and_create_error_response(
            &format!("Error serializing response body: {err}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

pub fn create_empty_response(status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder().status(status).body(Full::new(Bytes::new()))
}

/// Adds the permissive CORS headers the browser UI relies on.
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOWED_HEADERS),
    );
}

/// Takes a request's header map, and verifies that the "content-length" header, when present, is
/// valid and not larger than the given max_content_length. Requests without the header (chunked
/// transfer encoding, or no body at all) pass here; their actual size is checked after the body
/// is read.
///
/// Will return None if no issues are found. Otherwise returns an HTTP response with the
/// appropriate error status code.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
) -> Option<http::Result<HttpResponse>> {
    let content_length_header = match header_map.get(header::CONTENT_LENGTH) {
        Some(res) => res,
        None => {
            if let Some(transfer_encoding_header) = header_map.get(header::TRANSFER_ENCODING) {
                debug!(
                    "Transfer-Encoding header is present: {:?}",
                    transfer_encoding_header
                );
            }
            return None;
        }
    };
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|val| val.trim().parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some(log_and_create_error_response(
                "Invalid Content-Length header",
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(payload_too_large());
    }
    None
}

pub fn payload_too_large() -> http::Result<HttpResponse> {
    log_and_create_error_response("Payload too large", StatusCode::PAYLOAD_TOO_LARGE)
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use hyper::header;
    use hyper::HeaderMap;
    use hyper::StatusCode;

    use super::*;

    fn create_test_headers_with_content_length(val: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::CONTENT_LENGTH, val.parse().unwrap());
        map
    }

    async fn get_response_body_as_string(response: HttpResponse) -> String {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.into_iter().collect()).unwrap()
    }

    #[tokio::test]
    async fn test_request_content_length_missing_is_allowed() {
        assert!(verify_request_content_length(&HeaderMap::new(), 1).is_none());

        let mut chunked = HeaderMap::new();
        chunked.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        assert!(verify_request_content_length(&chunked, 1).is_none());
    }

    #[tokio::test]
    async fn test_request_content_length_cant_convert_to_usize() {
        let verify_result = verify_request_content_length(
            &create_test_headers_with_content_length("not_an_int"),
            1,
        );
        let response = verify_result.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            get_response_body_as_string(response).await,
            "{\"error\":\"Invalid Content-Length header\"}".to_string()
        );
    }

    #[tokio::test]
    async fn test_request_content_length_too_long() {
        let verify_result =
            verify_request_content_length(&create_test_headers_with_content_length("100"), 1);
        let response = verify_result.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            get_response_body_as_string(response).await,
            "{\"error\":\"Payload too large\"}".to_string()
        );
    }

    #[tokio::test]
    async fn test_request_content_length_within_limit() {
        let verify_result =
            verify_request_content_length(&create_test_headers_with_content_length("10"), 10);
        assert!(verify_result.is_none());
    }

    #[tokio::test]
    async fn test_json_response_body_and_content_type() {
        let response =
            create_json_response(&json!({ "success": true }), StatusCode::OK).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );
        assert_eq!(
            get_response_body_as_string(response).await,
            "{\"success\":true}"
        );
    }

    #[test]
    fn test_cors_headers() {
        let mut headers = HeaderMap::new();
        apply_cors_headers(&mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, DELETE, OPTIONS"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
    }

    #[tokio::test]
    async fn test_body_from_collects_back() {
        let bytes = body_from("payload").collect().await.unwrap().to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"payload"));
    }
}
