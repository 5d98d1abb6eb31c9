pub mod broadcaster;
pub mod sessions;

pub use broadcaster::{Broadcaster, SessionGuard};
pub use sessions::{EventReceiver, SessionId, SessionRegistry};
