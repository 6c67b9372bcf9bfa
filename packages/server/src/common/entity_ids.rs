//! Typed ID definitions for all domain entities.
//!
//! Each alias is incompatible with the others at compile time:
//!
//! ```compile_fail
//! use chairway_server::common::{ChairId, RideId};
//!
//! let ride_id = RideId::new();
//! let chair_id: ChairId = ride_id; // Compile error!
//! ```

pub use super::id::Id;

/// Marker type for User entities (ride-requesting passengers).
pub struct User;

/// Marker type for Owner entities (fleet owners).
pub struct Owner;

/// Marker type for Chair entities (dispatchable vehicles).
pub struct Chair;

/// Marker type for Ride entities.
pub struct Ride;

/// Marker type for ride status transition records.
pub struct RideStatusRecord;

pub type UserId = Id<User>;
pub type OwnerId = Id<Owner>;
pub type ChairId = Id<Chair>;
pub type RideId = Id<Ride>;
pub type RideStatusId = Id<RideStatusRecord>;
