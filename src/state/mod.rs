//! Optional persistence of plan execution state.

mod snapshot;

pub use snapshot::{PlanSnapshot, SnapshotStore, TaskSnapshot};
