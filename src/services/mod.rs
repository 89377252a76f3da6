// Lettuce Stream Services
// Core orchestration, platform, and relay services

mod credentials;
mod encryption;
mod error;
mod identity;
mod lifecycle;
mod orchestrator;
mod relay;
mod store;
mod youtube;

pub use credentials::*;
pub use encryption::*;
pub use error::*;
pub use identity::*;
pub use lifecycle::*;
pub use orchestrator::*;
pub use relay::*;
pub use store::*;
pub use youtube::*;
