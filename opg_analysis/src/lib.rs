mod decode;
mod inference;
mod routes;
mod server;
mod staging;
mod telemetry;

pub mod app;
pub mod config;
pub mod detection;
pub mod error;
pub mod pipeline;

pub use app::start_app;
pub use pipeline::{AnalysisPipeline, AnalysisResponse};
pub use staging::AnalysisRequest;
