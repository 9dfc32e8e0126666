pub mod agent;
pub mod board;
pub mod clinical_tools;
pub mod generic_types;
pub mod intake;
pub mod llm_client;
pub mod realtime_api;
pub mod records;
pub mod speech;
pub mod telemetry;
pub mod tools;
