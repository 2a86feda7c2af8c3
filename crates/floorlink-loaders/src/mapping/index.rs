//! Bidirectional frontend id ↔ equipment id index

use chrono::{DateTime, Utc};
use floorlink_core::{LoaderError, MappingEntry, MappingPayload};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Immutable index of one site's mapping table.
///
/// Forward and reverse tables are built together and swapped in as one
/// value, so a reader never sees one updated without the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingIndex {
    site_id: Option<String>,
    connected: bool,
    forward: BTreeMap<String, MappingEntry>,
    reverse: HashMap<String, String>,
    loaded_at: Option<DateTime<Utc>>,
}

impl MappingIndex {
    /// Build from a backend payload.
    ///
    /// `requested_site` is used when the payload does not name its site.
    ///
    /// # Errors
    /// `LoaderError::Validation` when an equipment id is empty, appears under
    /// two frontend ids, or the payload belongs to another site
    pub fn build(
        payload: MappingPayload,
        requested_site: Option<&str>,
        loaded_at: DateTime<Utc>,
    ) -> Result<Self, LoaderError> {
        if let (Some(requested), Some(actual)) = (requested_site, payload.site_id.as_deref()) {
            if requested != actual {
                return Err(LoaderError::validation(format!(
                    "requested site {requested}, backend returned {actual}"
                )));
            }
        }

        let mut forward = BTreeMap::new();
        let mut reverse = HashMap::with_capacity(payload.mappings.len());
        for (frontend_id, record) in payload.mappings {
            if record.equipment_id.is_empty() {
                return Err(LoaderError::validation(format!(
                    "mapping {frontend_id} has no equipment id"
                )));
            }
            if let Some(other) = reverse.insert(record.equipment_id.clone(), frontend_id.clone()) {
                return Err(LoaderError::validation(format!(
                    "equipment {} mapped to both {other} and {frontend_id}",
                    record.equipment_id
                )));
            }
            forward.insert(
                frontend_id.clone(),
                MappingEntry {
                    frontend_id,
                    equipment_id: record.equipment_id,
                    equipment_name: record.equipment_name,
                    equipment_code: record.equipment_code,
                    line_name: record.line_name,
                    updated_at: record.updated_at.unwrap_or(loaded_at),
                },
            );
        }

        Ok(Self {
            site_id: payload.site_id.or_else(|| requested_site.map(str::to_string)),
            connected: payload.connected,
            forward,
            reverse,
            loaded_at: Some(loaded_at),
        })
    }

    /// Entry for a frontend id
    #[must_use]
    pub fn lookup(&self, frontend_id: &str) -> Option<&MappingEntry> {
        self.forward.get(frontend_id)
    }

    /// Frontend id for an equipment id
    #[must_use]
    pub fn reverse_lookup(&self, equipment_id: &str) -> Option<&str> {
        self.reverse.get(equipment_id).map(String::as_str)
    }

    /// Entries ordered by frontend id
    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.forward.values()
    }

    /// Site of this table
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    /// Backend connectivity flag
    #[must_use]
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Number of mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// No mappings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Build time, `None` for the empty initial index
    #[must_use]
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Summary returned by loads
    #[must_use]
    pub fn summary(&self) -> MappingResult {
        MappingResult {
            connected: self.connected,
            site_id: self.site_id.clone(),
            count: self.len(),
        }
    }
}

/// Result of a mapping load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingResult {
    /// Backend connectivity flag
    pub connected: bool,
    /// Loaded site
    pub site_id: Option<String>,
    /// Number of mappings
    pub count: usize,
}
