// Domain layer - Core business logic

pub mod composition;
pub mod media;
pub mod model;
pub mod orientation;
pub mod rules;
pub mod settings;
