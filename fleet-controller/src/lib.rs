mod recording;
mod registry;
mod server;
mod store;

pub use recording::{RecordingConfig, RecordingSupervisor};
pub use registry::{DeviceRegistry, DeviceSession};
pub use server::{ApiError, EventKind, FleetConfig, FleetState, build_fleet_app};
pub use store::{DurableStore, JsonlStore, MemoryStore, StoreError, StoredEvent};
