//! Floorlink Core - Loader lifecycle contract
//!
//! The shared base every Floorlink data source builds on:
//! - A lifecycle state machine whose invalid calls are logged and rejected, never panicking
//! - An embedded event emitter with one-shot listeners and bus forwarding
//! - Retry, timeout and cooperative cancellation wrappers
//! - Keyed background timers released on dispose
//! - Collaborator traits for transports, push channels and editor state
//!
//! # Example
//!
//! ```rust,ignore
//! use floorlink_core::prelude::*;
//!
//! # async fn example(loader: impl DataLoader<Params = ()>) -> Result<(), LoaderError> {
//! loader.initialize().await?;
//! loader.on(LifecycleEvent::LOADED, |event| println!("{event:?}"));
//! loader.load(()).await?;
//! loader.dispose().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod api;
pub mod cancel;
pub mod contract;
pub mod error;
pub mod events;
pub mod retry;
pub mod state;
pub mod timers;

pub use api::{
    DashboardApi, EditState, EquipmentName, EquipmentRecord, HostVisibility, IdResolver,
    MappingApi, MappingEntry, MappingPayload, MappingRecord, MonitoringApi, PushClient,
    PushMessage, PushSignal, Snapshot, MAPPING_API_VERSION,
};
pub use cancel::{AbortSlot, AbortTicket};
pub use contract::{DataLoader, HealthReport, LoaderCore, LoaderStatus};
pub use error::{ErrorKind, LoaderError};
pub use events::{
    BroadcastBus, BusMessage, EventBus, EventEmitter, LifecycleEvent, ListenerHandle, ListenerId,
    LoaderEvent,
};
pub use retry::{with_retry, with_timeout, RetryPolicy};
pub use state::{allowed_transitions, validate_transition, LoaderState, TransitionError};
pub use timers::TimerSet;

/// Re-exported so loaders and callers share one token type
pub use tokio_util::sync::CancellationToken;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for implementing and driving loaders
    pub use crate::{
        DataLoader, HealthReport, LifecycleEvent, ListenerHandle, LoaderCore, LoaderError,
        LoaderEvent, LoaderState, LoaderStatus, RetryPolicy,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
