pub mod app;
pub mod config;
pub mod detection;
pub mod overlay;
pub mod pipeline;
pub mod present;
pub mod render;
pub mod session;
pub mod shapes;
pub mod video;
