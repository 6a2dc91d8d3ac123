// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod credentials;
mod crypto;
mod entities;
mod store;

pub use credentials::{
    ConfiguredModelSummary, ConfiguredModelUpdate, CredentialStore, NewConfiguredModel,
    ResolvedModel,
};
pub use crypto::{Aes256GcmProtector, CryptoError, KeyProtector};
pub use entities::*;
pub use store::{SqliteStore, StoreError};
