//! Shared primitives: typed entity ids, grid coordinates, session tokens.

pub mod entity_ids;
pub mod geo;
pub mod id;

pub use entity_ids::*;
pub use geo::*;
pub use id::*;

use uuid::Uuid;

/// Generate an opaque 64-hex-char session/registration token.
pub fn secure_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
