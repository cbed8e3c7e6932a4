//! Collaborator seams and side effects.

pub mod config;
pub mod lobby;
pub mod tick_engine;
pub mod wagering;
