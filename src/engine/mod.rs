//! Probability computation for markets.

pub mod evidence;

pub use evidence::{
    compute, EngineDiagnostics, EngineInput, EngineOutcome, EngineOutput, EnginePost, ALGORITHM,
    MAX_AGE_MS,
};
