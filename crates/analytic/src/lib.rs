//! `saleflow-analytic`: analytic cost lines and their reconciliation onto sale order lines.
//!
//! Posting a cost against a project's analytic account may create or reuse a
//! reinvoicing line on the project's confirmed order, and always re-derives the
//! delivered quantity of the lines it touches.

pub mod line;
pub mod reconcile;
pub mod store;

pub use line::AnalyticLine;
pub use reconcile::{AnalyticError, AnalyticReconciler, ReconcileContext, ReconcileError, ReconcileSettings};
pub use store::{AnalyticLineStore, InMemoryAnalyticLineStore};
