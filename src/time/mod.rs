pub mod contimer;

pub use contimer::{ConTimer, EventHandle};
