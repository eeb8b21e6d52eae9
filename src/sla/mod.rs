mod engine;
pub mod policy;
mod timer;

pub use engine::{SlaEngine, SweepReport, TimerStart};
pub use timer::{BreachKind, SlaTimer};
