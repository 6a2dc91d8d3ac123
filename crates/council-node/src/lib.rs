// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod ws;

pub use error::ApiError;
pub use routes::{router, serve, AppState};
