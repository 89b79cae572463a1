//! Routines: parsing and cooperative execution.
//!
//! - [`routine`]: the line-oriented script format
//! - [`engine`]: sequential execution with deferred continuations

pub mod engine;
pub mod routine;

pub use engine::{RoutineEngine, RoutineHost, RoutineIdentity, RoutineProgress, RoutineTiming};
pub use routine::{parse_line, Command, RoutineProgram};
