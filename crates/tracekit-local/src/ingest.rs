// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::broadcaster::{Broadcaster, LiveEvent};
use crate::error::IngestError;
use crate::normalizer;
use crate::otlp::OtlpTraceRequest;
use crate::trace_store::TraceStorage;

const UNKNOWN_SERVICE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    /// Number of spans stored from the batch.
    pub accepted: usize,
}

/// Drives decoded OTLP batches through the normalizer into the store, and announces each stored
/// record to live subscribers.
///
/// A store change and the event announcing it happen under one lock, so subscribers see events
/// in the same order the store applied the changes.
#[derive(Debug, Clone)]
pub struct IngestCoordinator {
    store: TraceStorage,
    broadcaster: Arc<Broadcaster>,
    publish_lock: Arc<Mutex<()>>,
}

impl IngestCoordinator {
    pub fn new(store: TraceStorage, broadcaster: Arc<Broadcaster>) -> Self {
        IngestCoordinator {
            store,
            broadcaster,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &TraceStorage {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Stores every span of the batch. Spans are handled independently; one with missing fields
    /// is stored with defaults rather than failing the batch.
    pub async fn ingest(&self, request: OtlpTraceRequest) -> IngestSummary {
        let mut accepted = 0;
        for resource_spans in request.resource_spans {
            let service = resource_spans
                .service_name()
                .unwrap_or(UNKNOWN_SERVICE)
                .to_string();

            for scope_spans in resource_spans.scope_spans {
                for span in scope_spans.spans {
                    let span = normalizer::normalize(span, &service);
                    let _guard = self.publish_lock.lock().await;
                    let record = self.store.add(span).await;
                    let delivered = self
                        .broadcaster
                        .publish(&LiveEvent::NewTrace { trace: record })
                        .await;
                    debug!("Stored span for service {service}, notified {delivered} subscribers");
                    accepted += 1;
                }
            }
        }
        IngestSummary { accepted }
    }

    /// Parses and validates a raw request body, then ingests it. Nothing is stored when the body
    /// is rejected.
    pub async fn ingest_body(&self, body: &[u8]) -> Result<IngestSummary, IngestError> {
        let request = OtlpTraceRequest::from_slice(body)?;
        Ok(self.ingest(request).await)
    }

    /// Empties the store and tells live subscribers about it.
    pub async fn clear(&self) {
        let _guard = self.publish_lock.lock().await;
        self.store.clear().await;
        self.broadcaster.publish(&LiveEvent::TracesCleared).await;
    }
}
