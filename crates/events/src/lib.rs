//! `payflow-events`: keyed message bus mechanics.

pub mod bus;
pub mod delivery;
pub mod in_memory_bus;

pub use bus::{Consumer, EventBus, partition_for};
pub use delivery::Delivery;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
