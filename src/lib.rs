// Lettuce Stream Backend Library
// Broadcast orchestration, platform lifecycle, and the streaming relay

pub mod models;
pub mod services;
