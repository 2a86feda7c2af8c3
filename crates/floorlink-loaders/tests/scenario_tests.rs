//! End-to-end flows through the registry against the simulated plant.

use floorlink_cache::{CachePriority, RefreshStrategy, WidgetConfig};
use floorlink_core::{DataLoader, LoaderError, LoaderState};
use floorlink_loaders::{
    DashboardConfig, DashboardParams, EquipmentStatus, FloorlinkConfig, LoadAllParams, LoadOutput,
    LoaderMode, LoaderRegistry, MappingParams, MonitoringParams, PlantLayout, PlantOp,
    RetrySettings, SimulatedPlant,
};
use floorlink_test_utils::RecordingBus;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn quick_retry() -> RetrySettings {
    RetrySettings {
        retries: 2,
        delay_ms: 10,
        ..RetrySettings::default()
    }
}

fn registry_for(plant: &Arc<SimulatedPlant>, config: FloorlinkConfig) -> LoaderRegistry {
    let registry = LoaderRegistry::new();
    registry.configure(plant.deps(), config);
    registry
}

#[tokio::test(start_paused = true)]
async fn full_plant_load() {
    let plant = SimulatedPlant::with_equipment(10);
    let dashboard = DashboardConfig::default()
        .with_widget("oee", WidgetConfig::new(CachePriority::High))
        .with_widget("alarms", WidgetConfig::new(CachePriority::Critical).with_strategy(RefreshStrategy::Hybrid));
    let registry = registry_for(
        &plant,
        FloorlinkConfig::default().with_retry(quick_retry()).with_dashboard(dashboard),
    );
    for mode in LoaderMode::ALL {
        registry.get_loader(mode, None).await.unwrap();
    }
    assert!(registry.initialize_all().await.iter().all(|r| r.result.is_ok()));

    let results = registry.load_all(&LoadAllParams::default()).await;

    assert_eq!(results.len(), 3);
    for result in &results {
        match &result.result {
            Ok(LoadOutput::Mapping(mapping)) => {
                assert_eq!(mapping.site_id.as_deref(), Some("site-a"));
                assert_eq!(mapping.count, 5);
            }
            Ok(LoadOutput::Monitoring(snapshot)) => {
                assert_eq!(snapshot.stats.total, 10);
                assert_eq!(snapshot.stats.disconnected_count, 2);
                assert_eq!(snapshot.status_counts.total(), 10);
                assert!(snapshot.subscribed);
            }
            Ok(LoadOutput::Dashboard(out)) => assert_eq!((out.loaded, out.failed), (2, 0)),
            Err(error) => panic!("{} failed: {error}", result.mode),
        }
    }
    assert_eq!(plant.applied_mappings().len(), 5);
    assert_eq!(
        registry.status().loaders.iter().map(|s| s.state).collect::<Vec<_>>(),
        vec![LoaderState::Loaded; 3]
    );

    registry.dispose_all().await;
    assert!(registry.status().loaders.is_empty());
}

#[tokio::test(start_paused = true)]
async fn push_updates_keep_counts_consistent() {
    let plant = SimulatedPlant::with_equipment(14);
    let registry = registry_for(&plant, FloorlinkConfig::default());
    let handle = registry.get_loader(LoaderMode::Monitoring, None).await.unwrap();
    let monitoring = handle.as_monitoring().unwrap().clone();
    monitoring.initialize().await.unwrap();
    monitoring.load(MonitoringParams::default()).await.unwrap();

    assert_eq!(plant.push_updates(40), 40);
    plant.push_status("eq-99", "RUNNING", true);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let counts = monitoring.status_counts();
    let stats = monitoring.stats();
    assert_eq!(stats.total, 15);
    assert_eq!(counts.total(), 15);
    assert_eq!(stats.updates_applied, 41);
    assert_eq!(stats.connected_count + stats.disconnected_count, 15);
    assert_eq!(monitoring.equipment("eq-99").unwrap().status, EquipmentStatus::Run);
}

#[tokio::test(start_paused = true)]
async fn channel_drop_then_reconnect_keeps_snapshot() {
    let plant = SimulatedPlant::with_equipment(6);
    let registry = registry_for(&plant, FloorlinkConfig::default());
    let handle = registry.get_loader(LoaderMode::Monitoring, None).await.unwrap();
    handle.initialize().await.unwrap();
    handle.load(&LoadAllParams::default()).await.unwrap();
    let monitoring = handle.as_monitoring().unwrap();
    assert!(monitoring.is_subscribed());

    plant.drop_channel("gateway restart");
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!monitoring.is_subscribed());
    assert!(!handle.health_check().await.healthy);

    handle.reconnect().await.unwrap();

    assert!(monitoring.is_subscribed());
    assert_eq!(plant.calls(PlantOp::Snapshot), 1);
    assert_eq!(plant.calls(PlantOp::Connect), 2);
    assert_eq!(monitoring.stats().total, 6);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let plant = SimulatedPlant::with_equipment(4);
    plant.fail_next(PlantOp::Site, 2);
    let registry = registry_for(&plant, FloorlinkConfig::default().with_retry(quick_retry()));
    let handle = registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
    let mapping = handle.as_mapping().unwrap();
    mapping.initialize().await.unwrap();

    let result = mapping.load(MappingParams::site("site-b")).await.unwrap();

    assert_eq!(result.count, 2);
    assert_eq!(plant.calls(PlantOp::Site), 3);
    assert_eq!(mapping.reverse_lookup("eq-2").as_deref(), Some("fe-2"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_in_status() {
    let plant = SimulatedPlant::with_equipment(4);
    plant.fail_next(PlantOp::Snapshot, 10);
    let registry = registry_for(&plant, FloorlinkConfig::default().with_retry(quick_retry()));
    let handle = registry.get_loader(LoaderMode::Monitoring, None).await.unwrap();
    handle.initialize().await.unwrap();

    let err = handle.load(&LoadAllParams::default()).await.unwrap_err();

    assert!(matches!(err, LoaderError::Network(_)));
    let status = handle.status();
    assert_eq!(status.state, LoaderState::Error);
    assert_eq!(status.last_error, Some(err));
    assert_eq!(plant.calls(PlantOp::Snapshot), 3);
}

#[tokio::test]
async fn site_change_round_trip() {
    let plant = SimulatedPlant::new(PlantLayout {
        equipment: 9,
        sites: vec!["north".into(), "south".into(), "east".into()],
        disconnected_every: 0,
    });
    let registry = registry_for(&plant, FloorlinkConfig::default());
    let handle = registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
    let mapping = handle.as_mapping().unwrap();
    mapping.initialize().await.unwrap();
    mapping.load(MappingParams::default()).await.unwrap();
    assert_eq!(plant.calls(PlantOp::Site), 1);

    let same = mapping.change_site("north").await.unwrap();
    assert_eq!(same.count, 3);
    assert_eq!(plant.calls(PlantOp::Site), 1);

    let east = mapping.change_site("east").await.unwrap();
    assert_eq!(east.site_id.as_deref(), Some("east"));
    assert_eq!(mapping.lookup("fe-3").unwrap().equipment_id, "eq-3");
    assert_eq!(mapping.lookup("fe-1"), None);

    let err = mapping.change_site("west").await.unwrap_err();
    assert!(matches!(err, LoaderError::Validation(_)));
    assert_eq!(mapping.current_site().as_deref(), Some("east"));
}

#[tokio::test]
async fn bus_sees_scoped_events() {
    let plant = SimulatedPlant::with_equipment(3);
    let bus = RecordingBus::new();
    let registry = LoaderRegistry::new();
    registry.configure(plant.deps().with_bus(bus.clone()), FloorlinkConfig::default());

    let handle = registry.get_loader(LoaderMode::Dashboard, None).await.unwrap();
    handle.initialize().await.unwrap();
    handle
        .load(&LoadAllParams {
            dashboard: DashboardParams::widgets(["kpi"]),
            ..LoadAllParams::default()
        })
        .await
        .unwrap();

    let names = bus.names();
    assert!(names.contains(&"dashboard:initialized".to_string()));
    assert!(names.contains(&"dashboard:widgetUpdated".to_string()));
    assert!(names.contains(&"dashboard:loaded".to_string()));
    for (name, payload) in bus.messages() {
        assert_eq!(payload["loader"], "dashboard", "{name}");
    }
}
