use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::hierarchy::{TreeNode, ViewHierarchy};

/// Target platform reported by a driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Android,
    #[serde(alias = "iOS")]
    Ios,
    Web,
}

/// Device geometry and identity, cached by the orchestrator per flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform: Platform,
    /// Physical screen size in pixels.
    pub width_pixels: i32,
    pub height_pixels: i32,
    /// Logical size the hierarchy bounds are reported in.
    pub width_grid: i32,
    pub height_grid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceOrientation {
    Portrait,
    LandscapeLeft,
    LandscapeRight,
    UpsideDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyCode {
    Enter,
    Backspace,
    Back,
    Home,
    Lock,
    VolumeUp,
    VolumeDown,
    RemoteUp,
    RemoteDown,
    RemoteLeft,
    RemoteRight,
    RemoteCenter,
    Power,
    Tab,
}

/// Multi-tap configuration for tap commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapRepeat {
    pub repeats: u32,
    pub delay_ms: u64,
}

/// Handle for an in-progress screen recording.
///
/// The orchestrator guarantees at most one per flow and closes it at flow
/// end; closing twice is prevented at the orchestrator level.
#[async_trait]
pub trait ScreenRecording: Send {
    async fn close(&mut self) -> Result<()>;
}

/// Platform-agnostic device driver.
///
/// This is the capability bundle the orchestrator drives: taps, swipes,
/// text input, app lifecycle, device toggles, screenshots and hierarchy
/// snapshots. Implementations wrap a concrete transport (adb, WebDriver,
/// simulator tooling); the orchestrator never sees the wire format.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name for diagnostics (e.g. "android", "ios", "web").
    fn name(&self) -> &str;

    async fn device_info(&self) -> Result<DeviceInfo>;

    /// Launch an application.
    ///
    /// # Arguments
    /// * `app_id` - package name (Android), bundle ID (iOS) or URL (web)
    /// * `launch_arguments` - extra arguments handed to the app process
    /// * `stop_if_running` - stop a running instance before launching
    async fn launch_app(
        &self,
        app_id: &str,
        launch_arguments: &HashMap<String, String>,
        stop_if_running: bool,
    ) -> Result<()>;

    async fn stop_app(&self, app_id: &str) -> Result<()>;

    async fn kill_app(&self, app_id: &str) -> Result<()>;

    async fn clear_app_state(&self, app_id: &str) -> Result<()>;

    /// Clear the simulator keychain (iOS only; no-op elsewhere).
    async fn clear_keychain(&self) -> Result<()> {
        Ok(())
    }

    async fn set_permissions(
        &self,
        app_id: &str,
        permissions: &HashMap<String, String>,
    ) -> Result<()>;

    async fn tap(&self, point: Point) -> Result<()>;

    /// Tap at a point given as percentages (0-100) of the screen.
    async fn tap_relative(&self, percent_x: i32, percent_y: i32) -> Result<()>;

    /// Tap a resolved element.
    ///
    /// `initial_hierarchy` is the snapshot the element was resolved in so
    /// the driver can re-check the screen when `retry_if_no_change` is set.
    #[allow(clippy::too_many_arguments)]
    async fn tap_on_element(
        &self,
        element: &TreeNode,
        initial_hierarchy: &ViewHierarchy,
        long_press: bool,
        retry_if_no_change: bool,
        wait_until_visible: bool,
        tap_repeat: Option<TapRepeat>,
        wait_to_settle_timeout_ms: Option<u64>,
        app_id: Option<&str>,
    ) -> Result<()>;

    async fn long_press(&self, point: Point) -> Result<()>;

    async fn press_key(&self, code: KeyCode) -> Result<()>;

    async fn input_text(&self, text: &str) -> Result<()>;

    async fn erase_text(&self, chars: u64) -> Result<()>;

    async fn hide_keyboard(&self) -> Result<()>;

    async fn back_press(&self) -> Result<()>;

    /// One screen-length vertical scroll.
    async fn scroll_vertical(&self) -> Result<()>;

    async fn swipe(
        &self,
        start: Point,
        end: Point,
        duration_ms: u64,
        wait_to_settle_timeout_ms: Option<u64>,
    ) -> Result<()>;

    /// Swipe across the whole screen in a direction.
    async fn swipe_direction(
        &self,
        direction: SwipeDirection,
        duration_ms: u64,
        wait_to_settle_timeout_ms: Option<u64>,
    ) -> Result<()>;

    /// Swipe starting from the screen center (used by scrolling searches).
    async fn swipe_from_center(
        &self,
        direction: SwipeDirection,
        duration_ms: u64,
        wait_to_settle_timeout_ms: Option<u64>,
    ) -> Result<()>;

    /// Swipe between two points given as percentages (0-100) of the screen.
    async fn swipe_relative(
        &self,
        start_percent: (i32, i32),
        end_percent: (i32, i32),
        duration_ms: u64,
        wait_to_settle_timeout_ms: Option<u64>,
    ) -> Result<()>;

    async fn open_link(
        &self,
        link: &str,
        app_id: Option<&str>,
        auto_verify: bool,
        browser: bool,
    ) -> Result<()>;

    async fn set_location(&self, latitude: f64, longitude: f64) -> Result<()>;

    async fn set_orientation(&self, orientation: DeviceOrientation) -> Result<()>;

    async fn set_airplane_mode(&self, enabled: bool) -> Result<()>;

    async fn is_airplane_mode_enabled(&self) -> Result<bool>;

    /// Push media files onto the device gallery.
    async fn add_media(&self, paths: &[String]) -> Result<()>;

    /// Capture a screenshot into `out` (PNG when `compressed` is false).
    async fn take_screenshot(&self, out: &mut Vec<u8>, compressed: bool) -> Result<()>;

    /// Start recording the screen into `path`, returning the handle that
    /// finalizes the file.
    async fn start_screen_recording(&self, path: &str) -> Result<Box<dyn ScreenRecording>>;

    async fn wait_for_animation_to_end(&self, timeout_ms: Option<u64>) -> Result<()>;

    /// Wait until the foreground app is idle enough to interact with.
    async fn wait_for_app_to_settle(&self, app_id: Option<&str>) -> Result<()> {
        let _ = app_id;
        Ok(())
    }

    /// Snapshot of the current UI tree.
    async fn view_hierarchy(&self) -> Result<ViewHierarchy>;

    fn is_unicode_input_supported(&self) -> bool {
        false
    }

    /// Android only: switch hierarchy dumping to Chrome DevTools for
    /// webview-heavy apps. No-op on other platforms.
    async fn set_android_chrome_dev_tools_enabled(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}
