//! Database models and DTOs for all domain entities.

pub mod alert;
pub mod block;
pub mod campaign;
pub mod event;
pub mod tenant;
