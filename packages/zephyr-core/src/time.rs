/// Platform-aware time utilities.
///
/// On native platforms this uses `chrono::Utc::now()`. On WASM it uses
/// `js_sys::Date::now()` since `std::time::SystemTime` is not available on
/// `wasm32-unknown-unknown`.

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now() as i64
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        chrono::Utc::now().timestamp_millis()
    }
}
