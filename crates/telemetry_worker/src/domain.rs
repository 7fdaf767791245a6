mod batch_worker;

pub use batch_worker::*;
