// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local trace backend: accepts OTLP/HTTP JSON trace exports, keeps a bounded window of recent
//! spans in memory, serves them over a small JSON API and streams new ones to live viewers over
//! a WebSocket.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod http_utils;
pub mod ingest;
pub mod live_channel;
pub mod local_ui;
pub mod normalizer;
pub mod otlp;
pub mod trace_processor;
pub mod trace_store;
