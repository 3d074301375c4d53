// src/server/middleware/mod.rs
pub mod validation;

// Re-export main components for cleaner imports
pub use validation::validate_message;
