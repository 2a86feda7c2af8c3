//! Injected collaborators
//!
//! Every collaborator is optional. Loaders check for what they need once, in
//! `initialize()`, and treat everything else as a capability that may be
//! absent.

use floorlink_core::{
    DashboardApi, EditState, EventBus, HostVisibility, LoaderError, MappingApi, MonitoringApi,
    PushClient,
};
use std::fmt;
use std::sync::Arc;

/// Shared dependencies handed to loaders
#[derive(Clone, Default)]
pub struct LoaderDeps {
    /// Snapshot client
    pub monitoring_api: Option<Arc<dyn MonitoringApi>>,
    /// Site mapping client
    pub mapping_api: Option<Arc<dyn MappingApi>>,
    /// Widget client
    pub dashboard_api: Option<Arc<dyn DashboardApi>>,
    /// Push channel
    pub push: Option<Arc<dyn PushClient>>,
    /// External event bus
    pub bus: Option<Arc<dyn EventBus>>,
    /// Editor state receiving loaded mappings
    pub edit_state: Option<Arc<dyn EditState>>,
    /// Host visibility signal
    pub visibility: Option<Arc<dyn HostVisibility>>,
}

impl LoaderDeps {
    /// No collaborators
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With snapshot client
    #[must_use]
    pub fn with_monitoring_api(mut self, api: Arc<dyn MonitoringApi>) -> Self {
        self.monitoring_api = Some(api);
        self
    }

    /// With mapping client
    #[must_use]
    pub fn with_mapping_api(mut self, api: Arc<dyn MappingApi>) -> Self {
        self.mapping_api = Some(api);
        self
    }

    /// With widget client
    #[must_use]
    pub fn with_dashboard_api(mut self, api: Arc<dyn DashboardApi>) -> Self {
        self.dashboard_api = Some(api);
        self
    }

    /// With push channel
    #[must_use]
    pub fn with_push(mut self, push: Arc<dyn PushClient>) -> Self {
        self.push = Some(push);
        self
    }

    /// With event bus
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// With edit state
    #[must_use]
    pub fn with_edit_state(mut self, edit_state: Arc<dyn EditState>) -> Self {
        self.edit_state = Some(edit_state);
        self
    }

    /// With visibility signal
    #[must_use]
    pub fn with_visibility(mut self, visibility: Arc<dyn HostVisibility>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Copy of `self` where every collaborator present in `overrides` wins
    #[must_use]
    pub fn merged_with(&self, overrides: &LoaderDeps) -> LoaderDeps {
        LoaderDeps {
            monitoring_api: overrides.monitoring_api.clone().or_else(|| self.monitoring_api.clone()),
            mapping_api: overrides.mapping_api.clone().or_else(|| self.mapping_api.clone()),
            dashboard_api: overrides.dashboard_api.clone().or_else(|| self.dashboard_api.clone()),
            push: overrides.push.clone().or_else(|| self.push.clone()),
            bus: overrides.bus.clone().or_else(|| self.bus.clone()),
            edit_state: overrides.edit_state.clone().or_else(|| self.edit_state.clone()),
            visibility: overrides.visibility.clone().or_else(|| self.visibility.clone()),
        }
    }
}

impl fmt::Debug for LoaderDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderDeps")
            .field("monitoring_api", &self.monitoring_api.is_some())
            .field("mapping_api", &self.mapping_api.is_some())
            .field("dashboard_api", &self.dashboard_api.is_some())
            .field("push", &self.push.is_some())
            .field("bus", &self.bus.is_some())
            .field("edit_state", &self.edit_state.is_some())
            .field("visibility", &self.visibility.is_some())
            .finish()
    }
}

/// Unwrap a required collaborator
pub(crate) fn require<T: ?Sized>(dep: Option<&Arc<T>>, name: &'static str) -> Result<Arc<T>, LoaderError> {
    dep.cloned().ok_or(LoaderError::MissingDependency(name))
}

/// Whether the host is hidden; no signal means visible
pub(crate) fn host_hidden(visibility: Option<&Arc<dyn HostVisibility>>) -> bool {
    visibility.is_some_and(|v| v.is_hidden())
}
