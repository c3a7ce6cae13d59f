// MIT License - Copyright (c) 2026 Peter Wright

pub mod link;
pub mod tls;

pub use link::{Backoff, LinkHandle, PanelLink, PanelLinkConfig, MAX_FRAME_BYTES};
