pub mod context;
pub mod logging;
