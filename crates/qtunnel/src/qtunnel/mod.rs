pub mod app;
pub mod backoff;
pub mod config;
pub mod logging;
pub mod net;
pub mod relay;
pub mod tls;
pub mod tunnel;

pub use app::{LogOverrides, Mode, run};
