//! Shared test utilities

use muster_gateway::{DbPool, DeviceProfile, Platform, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Build a device profile for tests
#[must_use]
pub fn test_profile(device_id: &str) -> DeviceProfile {
    DeviceProfile {
        device_id: device_id.to_string(),
        device_name: "Test Device".to_string(),
        model: "Pixel 8".to_string(),
        manufacturer: "Google".to_string(),
        platform: Platform::Android,
        os_version: "14".to_string(),
        app_version: "1.0.0".to_string(),
    }
}
