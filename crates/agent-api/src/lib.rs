//! HTTP API connecting a chat front-end to a video-processing agent.
//!
//! Uploads are stored and handed to a [`processor::BackgroundProcessor`],
//! which calls the remote `process_video` tool over MCP and records the
//! outcome in the [`registry::TaskRegistry`]. Clients poll
//! `/task-status/{task_id}` until the task is completed or failed, then chat
//! about the video through the [`agent::Agent`].

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod mcp;
pub mod processor;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod state;
pub mod task;

pub use routes::build_router;
pub use state::AppState;
