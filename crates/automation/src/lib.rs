//! Window derivation, the armed/active automation engine, and action
//! delivery.

pub mod engine;
pub mod executor;
pub mod windows;

pub use engine::VolumeAutomation;
pub use executor::{ActionContext, ActionDelivery, ActionExecutor, DeliveryChannel};
pub use windows::build_windows;
