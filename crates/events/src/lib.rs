//! Transition-event notification: the seam between the code that writes job state
//! and the code that reacts to it (dispatching outbound worker calls).

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
