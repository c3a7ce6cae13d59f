// MIT License - Copyright (c) 2026 Peter Wright

pub mod partition;
pub mod sensor;

use chrono::{DateTime, Utc};

/// Panel-level metadata. One panel per process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelMeta {
    pub software_version: Option<String>,
    pub last_error: Option<PanelError>,
}

/// A panel-reported error, kept as the panel's `last_error` attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelError {
    pub error_type: String,
    pub description: String,
    pub at: DateTime<Utc>,
}
