//! Debug logging utilities for natmem.
//!
//! Set the `NATMEM_DEBUG` environment variable to enable verbose logging:
//! - `NATMEM_DEBUG=1` - Enable all debug output
//! - `NATMEM_DEBUG=layout` - Enable only layout planning logs
//! - `NATMEM_DEBUG=arena` - Enable only arena reservation logs
//! - `NATMEM_DEBUG=segment` - Enable only segment registry logs
//! - `NATMEM_DEBUG=layout,segment` - Enable multiple categories
//!
//! Enabled categories are emitted as `tracing` debug events, so a subscriber
//! must still be installed to see them.

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Layout,
    Arena,
    Segment,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default, PartialEq, Eq)]
struct DebugConfig {
    enabled: bool,
    layout: bool,
    arena: bool,
    segment: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        match std::env::var("NATMEM_DEBUG") {
            Ok(val) => Self::parse(&val),
            Err(_) => Self::default(),
        }
    }

    fn parse(val: &str) -> Self {
        let val_lower = val.to_lowercase();
        if val_lower == "1" || val_lower == "all" {
            return Self {
                enabled: true,
                layout: true,
                arena: true,
                segment: true,
            };
        }
        Self {
            enabled: true,
            layout: val_lower.contains("layout"),
            arena: val_lower.contains("arena"),
            segment: val_lower.contains("segment"),
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    let config = get_config();
    if !config.enabled {
        return false;
    }
    match category {
        DebugCategory::All => config.layout || config.arena || config.segment,
        DebugCategory::Layout => config.layout,
        DebugCategory::Arena => config.arena,
        DebugCategory::Segment => config.segment,
    }
}

/// Debug macro for layout planning logs
#[macro_export]
macro_rules! debug_layout {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Layout) {
            ::tracing::debug!(target: "natmem::layout", $($arg)*);
        }
    };
}

/// Debug macro for arena reservation logs
#[macro_export]
macro_rules! debug_arena {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Arena) {
            ::tracing::debug!(target: "natmem::arena", $($arg)*);
        }
    };
}

/// Debug macro for segment registry logs
#[macro_export]
macro_rules! debug_segment {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Segment) {
            ::tracing::debug!(target: "natmem::segment", $($arg)*);
        }
    };
}
