mod client;
mod jetstream_queue;
mod traits;

pub use client::*;
pub use jetstream_queue::*;
pub use traits::*;
