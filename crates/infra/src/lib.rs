//! Infrastructure layer: configuration, the sales service facade and reporting.

pub mod config;
pub mod reporting;
pub mod service;


pub use config::SalesConfig;
pub use reporting::{SalesReporting, TeamSummary, TeamTargets};
pub use service::{Collaborators, SalesService, ServiceError, ServiceResult};
