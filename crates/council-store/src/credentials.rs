// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-user model credentials.
//!
//! Owns the `configured_models` table.  Keys are sealed by the injected
//! [`KeyProtector`] before they are written and unsealed only inside
//! [`CredentialStore::resolve`]; the plaintext exists solely in that return
//! value.  Nothing in this module logs key material, sealed or otherwise.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::crypto::KeyProtector;
use crate::entities::{ConfiguredModel, Provider};
use crate::store::{SqliteStore, StoreError};

/// A model registration request.  `api_key` is the plaintext as supplied by
/// the caller; it is sealed before persisting.
#[derive(Debug, Clone)]
pub struct NewConfiguredModel {
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    pub api_key: Option<String>,
}

/// Partial update.  `None` fields are left unchanged; a supplied `api_key`
/// replaces the sealed key.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredModelUpdate {
    pub model_name: Option<String>,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub provider: Option<Provider>,
    pub api_key: Option<String>,
}

/// Listing view: everything except key material.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredModelSummary {
    pub id: Uuid,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    pub has_key: bool,
}

impl From<&ConfiguredModel> for ConfiguredModelSummary {
    fn from(m: &ConfiguredModel) -> Self {
        Self {
            id: m.model_id,
            model_name: m.model_name.clone(),
            display_name: m.display_name.clone(),
            endpoint: m.endpoint.clone(),
            provider: m.provider,
            has_key: m.sealed_key.is_some(),
        }
    }
}

/// What a provider call needs: endpoint, dialect, and (if stored) the
/// unsealed key.  Callers treat a `None` key as a configuration error.
#[derive(Clone, Debug)]
pub struct ResolvedModel {
    pub endpoint: String,
    pub provider: Provider,
    pub api_key: Option<String>,
}

pub struct CredentialStore {
    store: Arc<SqliteStore>,
    protector: Arc<dyn KeyProtector>,
}

impl CredentialStore {
    pub fn new(store: Arc<SqliteStore>, protector: Arc<dyn KeyProtector>) -> Self {
        Self { store, protector }
    }

    /// All of one user's registrations, without key material.
    pub async fn list(&self, user: &str) -> Result<Vec<ConfiguredModelSummary>, StoreError> {
        let models = self.store.list_models(user).await?;
        Ok(models.iter().map(ConfiguredModelSummary::from).collect())
    }

    /// One registration by model name, without key material.
    pub async fn get(
        &self,
        user: &str,
        model_name: &str,
    ) -> Result<Option<ConfiguredModelSummary>, StoreError> {
        let model = self.store.get_model_by_name(user, model_name).await?;
        Ok(model.as_ref().map(ConfiguredModelSummary::from))
    }

    /// Register a model.  Fails with `Conflict` when `(user, model_name)`
    /// already exists.
    pub async fn add(
        &self,
        user: &str,
        new: NewConfiguredModel,
    ) -> Result<ConfiguredModelSummary, StoreError> {
        let sealed_key = new
            .api_key
            .as_deref()
            .map(|k| self.protector.seal(k))
            .transpose()?;
        let model = ConfiguredModel {
            model_id: Uuid::new_v4(),
            user_email: user.to_string(),
            model_name: new.model_name,
            display_name: new.display_name,
            endpoint: new.endpoint,
            provider: new.provider,
            sealed_key,
            created_at: Utc::now(),
        };
        self.store.insert_model(&model).await?;
        Ok(ConfiguredModelSummary::from(&model))
    }

    /// Update a registration by id.  Fails with `Conflict` when renaming
    /// would collide with another of the user's entries.
    pub async fn update(
        &self,
        user: &str,
        id: Uuid,
        update: ConfiguredModelUpdate,
    ) -> Result<ConfiguredModelSummary, StoreError> {
        let mut model = self
            .store
            .get_model(user, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("model {id}")))?;

        if let Some(name) = update.model_name {
            model.model_name = name;
        }
        if let Some(display) = update.display_name {
            model.display_name = Some(display);
        }
        if let Some(endpoint) = update.endpoint {
            model.endpoint = endpoint;
        }
        if let Some(provider) = update.provider {
            model.provider = provider;
        }
        if let Some(key) = update.api_key.as_deref() {
            model.sealed_key = Some(self.protector.seal(key)?);
        }

        self.store.update_model(&model).await?;
        Ok(ConfiguredModelSummary::from(&model))
    }

    pub async fn delete(&self, user: &str, id: Uuid) -> Result<bool, StoreError> {
        self.store.delete_model(user, id).await
    }

    /// Resolve a model for a provider call.
    ///
    /// Returns `NotFound` when the user has no registration under that name.
    /// The key is unsealed here and nowhere else; unseal failures propagate
    /// as `CryptoError` — there is no plaintext fallback.
    pub async fn resolve(
        &self,
        user: &str,
        model_name: &str,
    ) -> Result<ResolvedModel, StoreError> {
        let model = self
            .store
            .get_model_by_name(user, model_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("model `{model_name}` for {user}")))?;

        let api_key = model
            .sealed_key
            .as_deref()
            .map(|sealed| self.protector.unseal(sealed))
            .transpose()?;

        Ok(ResolvedModel {
            endpoint: model.endpoint,
            provider: model.provider,
            api_key,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
