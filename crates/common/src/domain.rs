mod device;
mod envelope;
mod in_memory_device_registry;
mod queue;
mod record;
mod result;
mod volatile_queue;
mod worker;

pub use device::*;
pub use envelope::*;
pub use in_memory_device_registry::*;
pub use queue::*;
pub use record::*;
pub use result::*;
pub use volatile_queue::*;
pub use worker::*;
