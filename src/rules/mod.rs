pub mod engine;
pub mod predicate;

pub use engine::ConditionEngine;
pub use predicate::Predicate;
