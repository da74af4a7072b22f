pub mod clock;
pub mod events;
pub mod fingerprint;
pub mod ids;
pub mod model;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use ids::{ObjectRef, SessionId, TabId, VolatileId, WindowId};
