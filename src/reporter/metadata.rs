use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sysinfo::System;

static APP_START: OnceLock<u64> = OnceLock::new();

/// Records the application start time on first call and returns it.
pub fn app_start_time() -> u64 {
    *APP_START.get_or_init(unix_secs)
}

/// Runtime facts posted to `report/metadata`. Memory figures are bytes.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub serial_no: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
    pub platform: String,
    pub architecture: String,
    pub app_start_time: u64,
    /// Seconds.
    pub app_uptime: u64,
    pub timestamp: u64,
    pub system_memory: u64,
    pub avail_memory: u64,
    pub app_memory: u64,
}

impl NodeMetadata {
    pub fn collect(serial_number: &str) -> Self {
        let start = app_start_time();
        let now = unix_secs();

        let mut system = System::new();
        system.refresh_memory();
        let app_memory = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_process(pid);
                system.process(pid).map(|process| process.memory())
            })
            .unwrap_or(0);

        Self {
            serial_no: serial_number.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: option_env!("VERGE_BUILD_TIME").map(str::to_string),
            platform: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            app_start_time: start,
            app_uptime: now.saturating_sub(start),
            timestamp: now,
            system_memory: system.total_memory(),
            avail_memory: system.available_memory(),
            app_memory,
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
