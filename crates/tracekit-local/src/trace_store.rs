// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory retention of normalized spans.
//!
//! [`TraceStore`] is the plain collection: newest-first, capped by count, with filtering,
//! pagination and age-based eviction. [`TraceStorage`] is the handle the rest of the process
//! shares. It guards one `TraceStore` behind a single async mutex (reads and writes alike) and
//! owns the periodic sweep task, which runs until [`TraceStorage::stop_cleanup`] is called.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::normalizer::{iso8601, NormalizedSpan};

pub const DEFAULT_PAGE_LIMIT: usize = 100;
const GENERATED_ID_PREFIX: &str = "trace_";
const GENERATED_ID_SUFFIX_LEN: usize = 9;
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A stored span: the normalized span plus the identity and ingestion time assigned on insert.
/// Records are never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    #[serde(flatten)]
    pub span: NormalizedSpan,
    /// Ingestion instant in epoch milliseconds; drives ordering and retention.
    pub timestamp: i64,
    #[serde(serialize_with = "iso8601::serialize")]
    pub received_at: DateTime<Utc>,
}

/// Equality filters and pagination for [`TraceStore::get_all`]. Empty filter strings are
/// treated as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceQuery {
    pub limit: usize,
    pub offset: usize,
    pub service: Option<String>,
    pub status: Option<String>,
}

impl Default for TraceQuery {
    fn default() -> Self {
        TraceQuery {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
            service: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracePage {
    pub traces: Vec<TraceRecord>,
    /// Number of records matching the filters, before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub total_traces: usize,
    /// Distinct service names, newest first.
    pub services: Vec<String>,
    #[serde(serialize_with = "iso8601::serialize_opt")]
    pub oldest_trace: Option<DateTime<Utc>>,
    #[serde(serialize_with = "iso8601::serialize_opt")]
    pub newest_trace: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TraceStore {
    /// Newest first.
    traces: VecDeque<TraceRecord>,
    config: StoreConfig,
}

impl TraceStore {
    pub fn new(config: StoreConfig) -> Self {
        TraceStore {
            traces: VecDeque::with_capacity(config.max_traces.min(1024)),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn add(&mut self, span: NormalizedSpan) -> TraceRecord {
        self.add_at(span, Utc::now())
    }

    /// Inserts a span received at `now`. The record's id is its trace id unless that id is
    /// missing or already taken by a stored record, in which case a `trace_<millis>_<suffix>`
    /// token is generated. Drops the oldest records beyond `max_traces`.
    pub fn add_at(&mut self, span: NormalizedSpan, now: DateTime<Utc>) -> TraceRecord {
        let timestamp = now.timestamp_millis();
        let id = match span.trace_id.as_deref().filter(|id| !id.is_empty()) {
            Some(trace_id) if !self.contains_id(trace_id) => trace_id.to_string(),
            _ => self.generate_unique_id(timestamp),
        };

        let record = TraceRecord {
            id,
            span,
            timestamp,
            received_at: now,
        };
        self.traces.push_front(record.clone());
        self.traces.truncate(self.config.max_traces);
        record
    }

    pub fn get_all(&self, query: &TraceQuery) -> TracePage {
        let service = query.service.as_deref().filter(|s| !s.is_empty());
        let status = query.status.as_deref().filter(|s| !s.is_empty());

        let filtered: Vec<&TraceRecord> = self
            .traces
            .iter()
            .filter(|t| service.map_or(true, |service| t.span.service == service))
            .filter(|t| status.map_or(true, |status| t.span.status.as_str() == status))
            .collect();

        TracePage {
            total: filtered.len(),
            traces: filtered
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect(),
            offset: query.offset,
            limit: query.limit,
        }
    }

    /// Looks a record up by its assigned id or by its raw trace id; the newest match wins.
    pub fn get_by_id(&self, id: &str) -> Option<&TraceRecord> {
        self.traces
            .iter()
            .find(|t| t.id == id || t.span.trace_id.as_deref() == Some(id))
    }

    /// Records ingested strictly after `since` (epoch milliseconds), newest first.
    pub fn get_recent(&self, since: i64) -> Vec<TraceRecord> {
        self.traces
            .iter()
            .filter(|t| t.timestamp > since)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.traces.clear();
    }

    pub fn stats(&self) -> TraceStats {
        let mut seen = HashSet::new();
        let services = self
            .traces
            .iter()
            .filter(|t| seen.insert(t.span.service.as_str()))
            .map(|t| t.span.service.clone())
            .collect();

        TraceStats {
            total_traces: self.traces.len(),
            services,
            oldest_trace: self.traces.back().map(|t| t.received_at),
            newest_trace: self.traces.front().map(|t| t.received_at),
        }
    }

    /// Removes every record not newer than `now - max_age` and returns how many were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let max_age_ms = i64::try_from(self.config.max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp_millis().saturating_sub(max_age_ms);
        let before = self.traces.len();
        self.traces.retain(|t| t.timestamp > cutoff);
        before - self.traces.len()
    }

    fn contains_id(&self, id: &str) -> bool {
        self.traces.iter().any(|t| t.id == id)
    }

    fn generate_unique_id(&self, now_ms: i64) -> String {
        loop {
            let id = generate_id(now_ms);
            if !self.contains_id(&id) {
                return id;
            }
        }
    }
}

fn generate_id(now_ms: i64) -> String {
    let suffix: String = (0..GENERATED_ID_SUFFIX_LEN)
        .map(|_| BASE36_ALPHABET[fastrand::usize(..BASE36_ALPHABET.len())] as char)
        .collect();
    format!("{GENERATED_ID_PREFIX}{now_ms}_{suffix}")
}

/// Shared handle to the process-wide trace store.
///
/// Cloning is cheap; all clones see the same records. Constructing one spawns the periodic
/// sweep, so it must happen inside a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TraceStorage {
    inner: Arc<Mutex<TraceStore>>,
    cleanup_token: CancellationToken,
}

impl TraceStorage {
    pub fn new(config: StoreConfig) -> Self {
        let storage = TraceStorage {
            inner: Arc::new(Mutex::new(TraceStore::new(config))),
            cleanup_token: CancellationToken::new(),
        };

        let sweeper = storage.clone();
        tokio::spawn(async move {
            sweeper.run_cleanup(config).await;
        });
        storage
    }

    async fn run_cleanup(self, config: StoreConfig) {
        let mut ticker = interval(config.cleanup_interval.max(MIN_CLEANUP_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = self.cleanup_token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        debug!("Trace store cleanup stopped");
    }

    /// Runs one age-based eviction pass immediately.
    pub async fn sweep(&self) -> usize {
        let removed = self.inner.lock().await.evict_expired(Utc::now());
        if removed > 0 {
            info!("Cleaned up {removed} old traces");
        }
        removed
    }

    /// Cancels the periodic sweep. Records and configuration are untouched; calling it again is
    /// a no-op.
    pub fn stop_cleanup(&self) {
        self.cleanup_token.cancel();
    }

    pub fn is_cleanup_running(&self) -> bool {
        !self.cleanup_token.is_cancelled()
    }

    pub async fn add(&self, span: NormalizedSpan) -> TraceRecord {
        self.inner.lock().await.add(span)
    }

    pub async fn get_all(&self, query: &TraceQuery) -> TracePage {
        self.inner.lock().await.get_all(query)
    }

    pub async fn get_by_id(&self, id: &str) -> Option<TraceRecord> {
        self.inner.lock().await.get_by_id(id).cloned()
    }

    pub async fn get_recent(&self, since: i64) -> Vec<TraceRecord> {
        self.inner.lock().await.get_recent(since)
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn stats(&self) -> TraceStats {
        self.inner.lock().await.stats()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
