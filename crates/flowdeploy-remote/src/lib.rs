//! Collaborators of the flowdeploy worker.
//!
//! Provides the seam traits (`Catalog`, `DeploymentTarget`, `FlowParser`,
//! `ModuleRegistry`, `TaskSource`, `TokenExchange`) plus the shipped
//! implementations: reqwest clients for the device repository, import
//! deployment service, flow parser, and flow engine, and a JSON-file
//! module registry.

mod auth;
mod catalog;
mod device_repo;
mod flow_engine;
mod flow_parser;
mod http;
mod imports;
mod registry;
mod traits;

pub use auth::{StaticTokenExchange, Token, TokenExchange};
pub use catalog::HttpCatalog;
pub use device_repo::DeviceRepositoryClient;
pub use flow_engine::FlowEngineClient;
pub use flow_parser::FlowParserClient;
pub use http::build_client;
pub use imports::ImportsClient;
pub use registry::FileModuleRegistry;
pub use traits::*;
