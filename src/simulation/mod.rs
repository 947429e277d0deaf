//! Simulation engine and its shared state.

pub mod engine;
pub mod state;

pub use engine::SimulationEngine;
pub use state::SharedSimulationState;
