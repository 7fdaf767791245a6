mod canonical;
mod replay_window;
mod signature;
mod traits;

pub use canonical::*;
pub use replay_window::*;
pub use signature::*;
pub use traits::*;

#[cfg(any(test, feature = "testing"))]
pub use traits::MockSignatureService;
