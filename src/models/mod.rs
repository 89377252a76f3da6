// Lettuce Stream Models
// Data structures for the application

mod connection;
mod session;

pub use connection::*;
pub use session::*;
