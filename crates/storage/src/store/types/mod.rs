#![forbid(unsafe_code)]

mod events;
mod jobs;

pub use events::*;
pub use jobs::*;
