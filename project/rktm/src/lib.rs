pub mod api;
pub mod cli;
pub mod conditions;
pub mod controllers;
pub mod errors;
pub mod lock;
pub mod mesh;
pub mod overrides;
pub mod ports;
pub mod prober;
pub mod protocol;
pub mod render;
pub mod resources;
pub mod secretref;
pub mod tlscert;
