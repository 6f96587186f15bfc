//! Tenant translation configuration API.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    Json,
};
use callflow_calls::{load_tenant_config, upsert_tenant_config};
use callflow_types::{is_valid_language_code, TenantTranslationConfig};
use serde::Deserialize;

use crate::error::{with_conn, ApiError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TranslationConfigRequest {
    pub translation_enabled: bool,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default)]
    pub voice_to_voice: bool,
}

/// Handler for `GET /api/tenants/{tenant_id}/translation-config`.
///
/// Tenants without a stored row get the disabled default.
pub async fn get_translation_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantTranslationConfig>, ApiError> {
    let config =
        with_conn(&state.pool, move |conn| Ok(load_tenant_config(conn, &tenant_id)?)).await?;
    Ok(Json(config))
}

/// Handler for `PUT /api/tenants/{tenant_id}/translation-config`.
///
/// Takes effect for calls started afterwards.
pub async fn put_translation_config_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    payload: Result<Json<TranslationConfigRequest>, JsonRejection>,
) -> Result<Json<TenantTranslationConfig>, ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError::bad_request("INVALID_REQUEST", e.body_text()))?;

    for (field, code) in [
        ("source_lang", &request.source_lang),
        ("target_lang", &request.target_lang),
    ] {
        if !is_valid_language_code(code) {
            return Err(ApiError::bad_request(
                "INVALID_LANGUAGE",
                format!("{field} '{code}' is not a language code"),
            ));
        }
    }

    let config = TenantTranslationConfig {
        tenant_id,
        translation_enabled: request.translation_enabled,
        source_lang: request.source_lang,
        target_lang: request.target_lang,
        voice_to_voice: request.voice_to_voice,
    };
    let stored = config.clone();
    with_conn(&state.pool, move |conn| Ok(upsert_tenant_config(conn, &stored)?)).await?;

    tracing::info!(
        tenant_id = %config.tenant_id,
        translation_enabled = config.translation_enabled,
        source_lang = %config.source_lang,
        target_lang = %config.target_lang,
        voice_to_voice = config.voice_to_voice,
        "tenant translation config updated"
    );
    Ok(Json(config))
}
