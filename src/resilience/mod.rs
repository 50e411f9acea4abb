// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure handling for remote calls: classification, backoff, circuit
//! breaking, and the executor that ties them together.

pub mod circuit_breaker;
pub mod classify;
pub mod executor;
pub mod retry;
