// Registry entities
//
// Practices and portfolios are identified by stable external ids. A practice
// belongs to exactly one portfolio at a time; reassignments are recorded but
// never rewrite ledger history.

pub mod portfolio;
pub mod practice;

pub use portfolio::Portfolio;
pub use practice::{Practice, PracticeReassignment};
