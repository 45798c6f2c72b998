pub mod app;
pub mod error;
pub mod groups;
pub mod handlers;
pub mod keypool;
pub mod relay;
pub mod stream_bridge;
