//! Presentation layer: the template collaborator and demo page contexts.

pub mod template;
pub mod views;
