// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{header, http, StatusCode};
use serde_json::json;
use tracing::{debug, error, info};

use crate::http_utils::{
    self, create_json_response, log_and_create_error_response, HttpRequest, HttpResponse,
};
use crate::ingest::IngestCoordinator;

const DEFAULT_SOURCE: &str = "SDK";

#[async_trait]
pub trait TraceProcessor {
    /// Reads an OTLP trace export from a hyper request body, ingests it, and builds the response
    /// returned to the exporting application.
    async fn process_traces(&self, req: HttpRequest) -> http::Result<HttpResponse>;
}

#[derive(Clone)]
pub struct OtlpTraceProcessor {
    pub coordinator: IngestCoordinator,
    pub max_request_content_length: usize,
}

#[async_trait]
impl TraceProcessor for OtlpTraceProcessor {
    async fn process_traces(&self, req: HttpRequest) -> http::Result<HttpResponse> {
        debug!("Received traces to process");
        let (parts, body) = req.into_parts();

        if let Some(response) = http_utils::verify_request_content_length(
            &parts.headers,
            self.max_request_content_length,
        ) {
            return response;
        }

        let source = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|val| val.to_str().ok())
            .filter(|val| !val.is_empty())
            .unwrap_or(DEFAULT_SOURCE)
            .to_string();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!("Error reading trace request body: {err}");
                return log_and_create_error_response(
                    "Failed to process traces",
                    StatusCode::INTERNAL_SERVER_ERROR,
                );
            }
        };

        // double check content length is < max request content length in case transfer encoding is used
        if body.len() > self.max_request_content_length {
            return http_utils::payload_too_large();
        }

        let summary = match self.coordinator.ingest_body(&body).await {
            Ok(summary) => summary,
            // both are caller-format errors
            Err(err) => {
                return log_and_create_error_response(&err.to_string(), StatusCode::BAD_REQUEST);
            }
        };
        info!("Received {} traces from {source}", summary.accepted);

        create_json_response(
            &json!({ "success": true, "tracesReceived": summary.accepted }),
            StatusCode::OK,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use hyper::Request;
    use serde_json::{json, Value};
    use tracing_test::traced_test;

    use crate::broadcaster::Broadcaster;
    use crate::config::StoreConfig;
    use crate::http_utils::{body_from, HttpResponse};
    use crate::ingest::IngestCoordinator;
    use crate::trace_processor::{OtlpTraceProcessor, TraceProcessor};
    use crate::trace_store::TraceStorage;

    fn create_test_processor(max_request_content_length: usize) -> OtlpTraceProcessor {
        OtlpTraceProcessor {
            coordinator: IngestCoordinator::new(
                TraceStorage::new(StoreConfig::default()),
                Arc::new(Broadcaster::new()),
            ),
            max_request_content_length,
        }
    }

    fn create_test_payload() -> Vec<u8> {
        json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [{ "key": "service.name", "value": { "stringValue": "checkout" } }]
                },
                "scopeSpans": [{
                    "spans": [
                        { "traceId": "abc", "spanId": "1", "name": "charge" },
                        { "traceId": "abc", "spanId": "2", "parentSpanId": "1", "name": "db" }
                    ]
                }]
            }]
        })
        .to_string()
        .into_bytes()
    }

    async fn get_response_body_as_json(response: HttpResponse) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_process_traces() {
        let payload = create_test_payload();
        let request = Request::builder()
            .method("POST")
            .header("content-length", payload.len().to_string())
            .header("user-agent", "OTel-OTLP-Exporter-Go/1.21.0")
            .body(body_from(payload))
            .unwrap();

        let trace_processor = create_test_processor(10 * 1024 * 1024);
        let response = trace_processor.process_traces(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            get_response_body_as_json(response).await,
            json!({ "success": true, "tracesReceived": 2 })
        );
        assert_eq!(trace_processor.coordinator.store().len().await, 2);
        assert!(logs_contain(
            "Received 2 traces from OTel-OTLP-Exporter-Go/1.21.0"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_process_traces_without_user_agent() {
        let request = Request::builder()
            .method("POST")
            .body(body_from(create_test_payload()))
            .unwrap();

        let response = create_test_processor(10 * 1024 * 1024)
            .process_traces(request)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(logs_contain("Received 2 traces from SDK"));
    }

    #[tokio::test]
    async fn test_invalid_trace_format() {
        let request = Request::builder()
            .method("POST")
            .body(body_from(r#"{"resourceSpans":"nope"}"#))
            .unwrap();

        let trace_processor = create_test_processor(1024);
        let response = trace_processor.process_traces(request).await.unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(
            get_response_body_as_json(response).await,
            json!({ "error": "Invalid trace format" })
        );
        assert_eq!(trace_processor.coordinator.store().len().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let request = Request::builder()
            .method("POST")
            .body(body_from("{not json"))
            .unwrap();

        let response = create_test_processor(1024)
            .process_traces(request)
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body = get_response_body_as_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON body"));
    }

    #[tokio::test]
    async fn test_declared_length_too_large() {
        let request = Request::builder()
            .method("POST")
            .header("content-length", "2048")
            .body(body_from(create_test_payload()))
            .unwrap();

        let response = create_test_processor(1024)
            .process_traces(request)
            .await
            .unwrap();
        assert_eq!(response.status(), 413);
    }

    #[tokio::test]
    async fn test_actual_body_too_large() {
        // no content-length, as with chunked transfer encoding
        let request = Request::builder()
            .method("POST")
            .body(body_from(create_test_payload()))
            .unwrap();

        let trace_processor = create_test_processor(16);
        let response = trace_processor.process_traces(request).await.unwrap();
        assert_eq!(response.status(), 413);
        assert_eq!(trace_processor.coordinator.store().len().await, 0);
    }
}
