pub mod logparser;
pub mod manager;
pub mod pipeline;
pub mod telemetry;

pub use logparser::LogParserController;
pub use manager::Controller;
pub use manager::ControllerManager;
pub use pipeline::{PipelineKind, PipelineReconciler, Probers};
pub use telemetry::TelemetryController;
