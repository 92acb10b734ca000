pub mod cloud;
pub mod controller;
pub mod error;
pub mod params;
pub mod poke;
pub mod snapshot_cache;
pub mod startup_script;

pub use controller::{Controller, DefaultController};
pub use error::ControllerError;
pub use params::ControllerParams;
