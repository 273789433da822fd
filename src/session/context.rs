//! Shared services an exporter runs against

use std::sync::Arc;

use crate::config::ExportConfig;
use crate::mapper::ElementMapper;
use crate::selector::Selector;
use crate::stats::{LogStatsCollector, StatsCollector};

/// Everything an exporter needs besides its protocol
///
/// Cheap to clone; one context is usually shared by every exporter of a
/// connection group.
#[derive(Clone)]
pub struct ExportContext {
    /// Resolves media and exports
    pub mapper: Arc<dyn ElementMapper>,
    /// Loop running elements and request state
    pub media_selector: Arc<Selector>,
    /// Loop performing wire I/O and owning exporter lifetimes
    pub net_selector: Arc<Selector>,
    /// Stats sink
    pub stats: Arc<dyn StatsCollector>,
    /// Exporter settings
    pub config: Arc<ExportConfig>,
}

impl ExportContext {
    /// Create a context with default config and log-only stats
    pub fn new(
        mapper: Arc<dyn ElementMapper>,
        media_selector: Arc<Selector>,
        net_selector: Arc<Selector>,
    ) -> Self {
        Self {
            mapper,
            media_selector,
            net_selector,
            stats: Arc::new(LogStatsCollector),
            config: Arc::new(ExportConfig::default()),
        }
    }

    /// Use another stats sink
    pub fn with_stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    /// Use another config
    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

impl std::fmt::Debug for ExportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportContext")
            .field("media_selector", &self.media_selector)
            .field("net_selector", &self.net_selector)
            .field("config", &self.config)
            .finish()
    }
}
