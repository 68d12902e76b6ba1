//! Typed id definitions for every dispatch entity.
//!
//! Each id type has a unique prefix identifying the entity. All ids
//! are ULID-based and therefore sortable by creation time.

use crate::define_id;

// Orders and their bindings
define_id!(OrderId, "ord");
define_id!(AssignmentId, "asg");

// Rounds and participation
define_id!(RoundId, "rnd");
define_id!(SignupId, "sgn");

// People (volunteers, clinicians, team leads, requesters)
define_id!(UserId, "usr");
