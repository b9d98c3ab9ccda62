//! Shared handles passed to every render component

use std::sync::Arc;

use super::backend::GpuDevice;
use super::device::Device;
use super::stats::{FrameStats, StatsSink};
use crate::settings::Settings;

/// Device, runtime settings and statistics sink
///
/// Cloning is cheap; every clone refers to the same objects.
#[derive(Clone)]
pub struct RenderContext {
    /// GPU device
    pub device: Arc<Device>,
    /// Runtime settings consulted during swapchain negotiation
    pub settings: Arc<Settings>,
    /// Frame statistics
    pub stats: Arc<dyn StatsSink>,
}

impl RenderContext {
    /// Bundle existing handles
    pub fn new(device: Arc<Device>, settings: Arc<Settings>, stats: Arc<dyn StatsSink>) -> Self {
        Self {
            device,
            settings,
            stats,
        }
    }

    /// Context over a raw backend with default settings and fresh stats
    pub fn with_defaults(raw: Box<dyn GpuDevice>) -> Self {
        Self::new(
            Device::new(raw),
            Arc::new(Settings::with_defaults()),
            Arc::new(FrameStats::new()),
        )
    }
}
