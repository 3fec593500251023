//! request runner status structs

use serde::{Deserialize, Serialize};

pub type JsonString = String;

pub const OK: &str = "ok";
pub const DOWN: &str = "down";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub error_count: u16,
    pub worker_count: usize,
    pub active_requests: usize,
    pub queued_requests: usize,
}

impl WorkerStatus {
    pub fn new(worker_id: String, state: WorkerState, uptime: String) -> WorkerStatus {
        let status = match state {
            WorkerState::Shutdown => DOWN,
            _ => OK,
        };

        WorkerStatus {
            worker_id,
            status: status.to_string(),
            state,
            uptime,
            error_count: 0,
            worker_count: 0,
            active_requests: 0,
            queued_requests: 0,
        }
    }

    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => {
                format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}")
            }
        }
    }
}
