use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::Backend;

/// Default directory for channel files
static SHM_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("MILK_SHM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/dev/shm"))
});

pub fn shm_dir() -> &'static Path {
    &SHM_DIR
}

/// `<prefix><unit><channel>`, e.g. `simcam00`
pub fn default_stream_name(backend: Backend, unit: u32, channel: u32) -> String {
    format!("{}{}{}", backend.stream_prefix(), unit, channel)
}

pub fn feedback_stream_name(image_name: &str) -> String {
    format!("{}_params_fb", image_name)
}

/// Wall-clock microseconds since the Unix epoch
pub fn micros_since_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names() {
        assert_eq!(default_stream_name(Backend::Simulated, 0, 0), "simcam00");
        assert_eq!(default_stream_name(Backend::V4l2, 1, 2), "v4lcam12");
        assert_eq!(feedback_stream_name("simcam00"), "simcam00_params_fb");
    }
}
