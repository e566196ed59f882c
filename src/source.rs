//! Screen sources: where frames and the active-window context come from.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::config::MonitorSelection;
use crate::error::Result;
use crate::storage::MonitorId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub id: MonitorId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
}

/// The focused application at capture time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub app_name: String,
    pub title: String,
}

/// Platform capture capability. Implementations are called from blocking
/// worker threads, one call per monitor per tick.
pub trait ScreenSource: Send + Sync {
    fn monitors(&self) -> Result<Vec<MonitorInfo>>;

    fn capture(&self, monitor: MonitorId) -> Result<DynamicImage>;

    /// `None` when the focused window cannot be determined.
    fn active_window(&self) -> Option<WindowInfo> {
        None
    }
}

/// Monitors in scope for `selection`. Falls back to the first monitor when
/// none reports itself as primary.
pub fn select_monitors(monitors: Vec<MonitorInfo>, selection: MonitorSelection) -> Vec<MonitorInfo> {
    match selection {
        MonitorSelection::All => monitors,
        MonitorSelection::PrimaryOnly => {
            let primary = monitors.iter().position(|m| m.is_primary).unwrap_or(0);
            monitors.into_iter().nth(primary).into_iter().collect()
        }
    }
}

#[cfg(feature = "native-capture")]
pub use native::XcapSource;

#[cfg(feature = "native-capture")]
mod native {
    use super::*;
    use crate::error::RecallError;
    use xcap::{Monitor, Window};

    /// Captures physical displays through `xcap`.
    #[derive(Debug, Default)]
    pub struct XcapSource;

    impl XcapSource {
        pub fn new() -> Self {
            Self
        }

        fn find(&self, monitor: MonitorId) -> Result<Monitor> {
            Monitor::all()
                .map_err(|e| RecallError::Capture(format!("Failed to list monitors: {}", e)))?
                .into_iter()
                .find(|m| m.id().ok() == Some(monitor.0))
                .ok_or_else(|| RecallError::Capture(format!("{} is no longer attached", monitor)))
        }
    }

    impl ScreenSource for XcapSource {
        fn monitors(&self) -> Result<Vec<MonitorInfo>> {
            let monitors = Monitor::all()
                .map_err(|e| RecallError::Capture(format!("Failed to list monitors: {}", e)))?;
            Ok(monitors
                .into_iter()
                .filter_map(|m| {
                    Some(MonitorInfo {
                        id: MonitorId(m.id().ok()?),
                        name: m.name().unwrap_or_default(),
                        width: m.width().unwrap_or(0),
                        height: m.height().unwrap_or(0),
                        is_primary: m.is_primary().unwrap_or(false),
                    })
                })
                .collect())
        }

        fn capture(&self, monitor: MonitorId) -> Result<DynamicImage> {
            let rgba = self
                .find(monitor)?
                .capture_image()
                .map_err(|e| RecallError::Capture(format!("{}: {}", monitor, e)))?;
            if rgba.width() == 0 || rgba.height() == 0 {
                return Err(RecallError::Capture(format!("{} returned an empty image", monitor)));
            }
            Ok(DynamicImage::ImageRgba8(rgba))
        }

        fn active_window(&self) -> Option<WindowInfo> {
            let windows = match Window::all() {
                Ok(w) => w,
                Err(e) => {
                    tracing::debug!("xcap::Window::all() failed: {}", e);
                    return None;
                }
            };
            windows
                .into_iter()
                .find(|w| w.is_focused().unwrap_or(false) && !w.is_minimized().unwrap_or(false))
                .map(|w| WindowInfo {
                    app_name: w.app_name().unwrap_or_default(),
                    title: w.title().unwrap_or_default(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: u32, primary: bool) -> MonitorInfo {
        MonitorInfo {
            id: MonitorId(id),
            name: format!("display {}", id),
            width: 1920,
            height: 1080,
            is_primary: primary,
        }
    }

    #[test]
    fn test_select_monitors() {
        let all = vec![monitor(1, false), monitor(2, true), monitor(3, false)];

        assert_eq!(select_monitors(all.clone(), MonitorSelection::All).len(), 3);

        let primary = select_monitors(all, MonitorSelection::PrimaryOnly);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].id, MonitorId(2));

        let no_primary = select_monitors(vec![monitor(7, false), monitor(8, false)], MonitorSelection::PrimaryOnly);
        assert_eq!(no_primary[0].id, MonitorId(7));

        assert!(select_monitors(Vec::new(), MonitorSelection::PrimaryOnly).is_empty());
    }
}
