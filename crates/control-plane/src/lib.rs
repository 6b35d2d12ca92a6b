// Waitlist Control Plane Library
// Shared by the API server and the export-openapi binary

// API routes and types (shared for OpenAPI generation)
pub mod api;

// Router assembly
pub mod app;

// Environment configuration
pub mod config;

// OpenAPI spec generation
pub mod openapi;

// Periodic reconciliation
pub mod scheduler;

// Services layer
pub mod services;
pub use services::PositionService;

// Storage backend selection
pub mod storage;

// Logging and tracing
pub mod telemetry;
