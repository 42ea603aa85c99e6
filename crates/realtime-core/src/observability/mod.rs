//! Process health surface.

pub mod health;
