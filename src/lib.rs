pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod gbdt;
pub mod http_client;
pub mod linear;
pub mod logging;
pub mod model_artifact;
pub mod numerai_api;
pub mod pipeline;
pub mod submission;
