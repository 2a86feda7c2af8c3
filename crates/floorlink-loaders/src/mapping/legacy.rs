//! Adapter for the older site-config source
//!
//! The old source returns a flat list of rows per site and has no separate
//! names endpoint. [`LegacySiteConfigAdapter`] presents it through the
//! current [`MappingApi`] so the loader only ever talks to one interface.

use async_trait::async_trait;
use floorlink_core::{EquipmentName, LoaderError, MappingApi, MappingPayload, MappingRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Interface version spoken by [`LegacySiteConfigSource`]
pub const LEGACY_API_VERSION: u32 = 1;

/// One row of a legacy site config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMappingRow {
    /// UI id
    pub frontend_id: String,
    /// Backend id
    pub equipment_id: String,
    /// Display name
    pub equipment_name: String,
    /// Equipment code
    #[serde(default)]
    pub code: Option<String>,
    /// Production line
    #[serde(default)]
    pub line: Option<String>,
}

/// Legacy site config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySiteConfig {
    /// Site id
    pub site_id: String,
    /// Connectivity flag
    pub online: bool,
    /// Mapping rows
    pub rows: Vec<LegacyMappingRow>,
}

/// Old site-config source
#[async_trait]
pub trait LegacySiteConfigSource: Send + Sync {
    /// Config of `site_id`, or of the current site for `None`
    async fn fetch_site_config(&self, site_id: Option<&str>) -> Result<LegacySiteConfig, LoaderError>;
}

/// [`MappingApi`] over a [`LegacySiteConfigSource`]
#[derive(Clone)]
pub struct LegacySiteConfigAdapter {
    source: Arc<dyn LegacySiteConfigSource>,
}

impl LegacySiteConfigAdapter {
    /// Wrap a legacy source
    #[must_use]
    pub fn new(source: Arc<dyn LegacySiteConfigSource>) -> Self {
        Self { source }
    }
}

impl std::fmt::Debug for LegacySiteConfigAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacySiteConfigAdapter").finish_non_exhaustive()
    }
}

impl TryFrom<LegacySiteConfig> for MappingPayload {
    type Error = LoaderError;

    /// # Errors
    /// `LoaderError::Validation` when a frontend id appears on two rows
    fn try_from(config: LegacySiteConfig) -> Result<Self, Self::Error> {
        let mut mappings = BTreeMap::new();
        for row in config.rows {
            let record = MappingRecord {
                equipment_id: row.equipment_id,
                equipment_name: row.equipment_name,
                equipment_code: row.code,
                line_name: row.line,
                updated_at: None,
            };
            if let Some(previous) = mappings.insert(row.frontend_id.clone(), record) {
                return Err(LoaderError::validation(format!(
                    "frontend id {} mapped to both {} and {} in site {}",
                    row.frontend_id, previous.equipment_id, mappings[&row.frontend_id].equipment_id, config.site_id
                )));
            }
        }
        Ok(Self {
            connected: config.online,
            site_id: Some(config.site_id),
            mappings,
        })
    }
}

#[async_trait]
impl MappingApi for LegacySiteConfigAdapter {
    fn api_version(&self) -> u32 {
        LEGACY_API_VERSION
    }

    async fn fetch_current_site(&self) -> Result<MappingPayload, LoaderError> {
        self.source.fetch_site_config(None).await?.try_into()
    }

    async fn fetch_site(&self, site_id: &str) -> Result<MappingPayload, LoaderError> {
        self.source.fetch_site_config(Some(site_id)).await?.try_into()
    }

    /// Names derived from the current site's rows
    async fn fetch_equipment_names(&self) -> Result<Vec<EquipmentName>, LoaderError> {
        let config = self.source.fetch_site_config(None).await?;
        let mut names: BTreeMap<String, EquipmentName> = BTreeMap::new();
        for row in config.rows {
            names.entry(row.equipment_id.clone()).or_insert(EquipmentName {
                equipment_id: row.equipment_id,
                equipment_name: row.equipment_name,
                equipment_code: row.code,
            });
        }
        Ok(names.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedSource;

    #[async_trait]
    impl LegacySiteConfigSource for FixedSource {
        async fn fetch_site_config(&self, site_id: Option<&str>) -> Result<LegacySiteConfig, LoaderError> {
            let row = |fe: &str, eq: &str| LegacyMappingRow {
                frontend_id: fe.into(),
                equipment_id: eq.into(),
                equipment_name: format!("Unit {eq}"),
                code: None,
                line: Some("L1".into()),
            };
            Ok(LegacySiteConfig {
                site_id: site_id.unwrap_or("home").to_string(),
                online: true,
                rows: vec![row("fe-b", "eq-2"), row("fe-a", "eq-1")],
            })
        }
    }

    #[tokio::test]
    async fn adapts_rows_to_payload() {
        let adapter = LegacySiteConfigAdapter::new(Arc::new(FixedSource));
        assert_eq!(adapter.api_version(), LEGACY_API_VERSION);

        let payload = adapter.fetch_site("site_x").await.unwrap();
        assert_eq!(payload.site_id.as_deref(), Some("site_x"));
        assert_eq!(payload.mappings["fe-a"].equipment_id, "eq-1");
        assert_eq!(payload.mappings["fe-b"].line_name.as_deref(), Some("L1"));

        let current = adapter.fetch_current_site().await.unwrap();
        assert_eq!(current.site_id.as_deref(), Some("home"));
    }

    #[test]
    fn duplicate_frontend_id_is_rejected() {
        let row = |eq: &str| LegacyMappingRow {
            frontend_id: "fe-a".into(),
            equipment_id: eq.into(),
            equipment_name: eq.into(),
            code: None,
            line: None,
        };
        let config = LegacySiteConfig {
            site_id: "site_x".into(),
            online: true,
            rows: vec![row("eq-1"), row("eq-2")],
        };

        let err = MappingPayload::try_from(config).unwrap_err();
        assert!(matches!(err, LoaderError::Validation(msg) if msg.contains("fe-a") && msg.contains("site_x")));
    }

    #[tokio::test]
    async fn names_are_deduplicated_and_sorted() {
        let adapter = LegacySiteConfigAdapter::new(Arc::new(FixedSource));
        let names = adapter.fetch_equipment_names().await.unwrap();
        let ids: Vec<_> = names.iter().map(|n| n.equipment_id.as_str()).collect();
        assert_eq!(ids, vec!["eq-1", "eq-2"]);
    }
}
