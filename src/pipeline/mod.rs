pub mod trigger_engine;

pub use trigger_engine::{CycleReport, TriggerEngine};
