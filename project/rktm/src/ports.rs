//! Well-known container ports of the managed collectors.

pub const OTLP_GRPC: i32 = 4317;
pub const OTLP_HTTP: i32 = 4318;
pub const METRICS: i32 = 8888;
pub const HEALTH_CHECK: i32 = 13133;
/// Envoy sidecar metrics, only opened when the mesh is active.
pub const ISTIO_ENVOY: i32 = 15090;

pub const FLUENT_BIT_HTTP: i32 = 2020;
pub const FLUENT_BIT_EXPORTER_METRICS: i32 = 2021;
