//! Threshold evaluation
//!
//! Fetchers hand [`Observation`]s to the [`Evaluator`], which compares them
//! against the live rule store and returns one [`Decision`] per rule that
//! fires.

pub mod decision;
pub mod evaluator;

pub use decision::{
    Decision, MetricObservation, Observation, PredictionObservation, PriceObservation,
};
pub use evaluator::Evaluator;
