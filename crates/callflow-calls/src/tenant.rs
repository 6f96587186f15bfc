//! Storage for per-tenant translation settings.

use callflow_types::TenantTranslationConfig;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CallError;

/// Returns the stored configuration for a tenant, if any.
pub fn get_tenant_config(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Option<TenantTranslationConfig>, CallError> {
    let config = conn
        .query_row(
            "SELECT tenant_id, translation_enabled, source_lang, target_lang, voice_to_voice
             FROM tenant_translation_config WHERE tenant_id = ?1",
            [tenant_id],
            |row| {
                Ok(TenantTranslationConfig {
                    tenant_id: row.get(0)?,
                    translation_enabled: row.get(1)?,
                    source_lang: row.get(2)?,
                    target_lang: row.get(3)?,
                    voice_to_voice: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(config)
}

/// Returns the stored configuration, or a disabled one for unknown tenants.
pub fn load_tenant_config(
    conn: &Connection,
    tenant_id: &str,
) -> Result<TenantTranslationConfig, CallError> {
    Ok(get_tenant_config(conn, tenant_id)?
        .unwrap_or_else(|| TenantTranslationConfig::disabled(tenant_id)))
}

/// Creates or replaces a tenant's configuration.
///
/// Language codes are not validated here; callers check
/// [`TenantTranslationConfig::has_valid_languages`] first.
pub fn upsert_tenant_config(
    conn: &Connection,
    config: &TenantTranslationConfig,
) -> Result<(), CallError> {
    conn.execute(
        "INSERT INTO tenant_translation_config
            (tenant_id, translation_enabled, source_lang, target_lang, voice_to_voice)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(tenant_id) DO UPDATE SET
            translation_enabled = excluded.translation_enabled,
            source_lang = excluded.source_lang,
            target_lang = excluded.target_lang,
            voice_to_voice = excluded.voice_to_voice,
            updated_at = datetime('now')",
        params![
            config.tenant_id,
            config.translation_enabled,
            config.source_lang,
            config.target_lang,
            config.voice_to_voice,
        ],
    )?;
    Ok(())
}
