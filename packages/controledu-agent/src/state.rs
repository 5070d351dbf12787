//! Agent-wide configuration (C11). The agent itself has no concurrent
//! shared state beyond this — per §5 it is a single cooperative loop,
//! so everything mutable lives directly on [`crate::agent::AgentLoop`].

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub host_name: String,
    pub user_name: String,
    pub os_description: String,
    pub capture_width: u32,
    pub capture_height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub min_jpeg_quality: u8,
    pub max_jpeg_quality: u8,
}

impl AgentConfig {
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("controledu-agent.db")
    }
}
