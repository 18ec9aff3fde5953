//! Shared application state injected into every handler.

use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::Agent;
use crate::mcp::VideoTool;
use crate::processor::BackgroundProcessor;
use crate::registry::TaskRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub processor: BackgroundProcessor,
    pub agent: Arc<dyn Agent>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        registry: Arc<TaskRegistry>,
        tool: Arc<dyn VideoTool>,
        agent: Arc<dyn Agent>,
        upload_dir: PathBuf,
        max_upload_bytes: usize,
    ) -> Self {
        let processor = BackgroundProcessor::new(Arc::clone(&registry), tool);
        Self {
            registry,
            processor,
            agent,
            upload_dir,
            max_upload_bytes,
        }
    }
}
