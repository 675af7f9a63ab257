//! Network sandbox bookkeeping (spec §4.7 "Network sandbox lifecycle").

mod pause;

pub use pause::{PauseRegistry, PAUSE_CONTAINER_NAME_PREFIX};
