pub mod fare;
pub mod models;

pub use fare::*;
pub use models::*;
