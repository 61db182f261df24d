pub mod client;
pub mod config;
pub mod detector;
pub mod gateway;
pub mod schema;
pub mod server;

// Re-export commonly used types
pub use client::{ClientError, LettuceClient, LettuceClientAsync};
pub use config::ServerConfig;
pub use detector::{
    DetectionMethod, DetectorOptions, HallucinationModel, ModelManager, OutputFormat,
    RawPrediction,
};
pub use gateway::{DetectionGateway, GatewayStats, InferenceError};
pub use schema::{
    DetectionRequest, SpanDetectionItem, SpanDetectionResponse, TokenDetectionItem,
    TokenDetectionResponse, ValidationError,
};
pub use server::{ApiError, ApiServer, AppState};
