//! Foundational low-level utilities shared across bgops crates.
//!
//! Provides atomic file-write helpers, size-rotated audit log appends, and
//! time utilities used by the ledger, status artifacts, and retention sweeps.

pub mod atomic_io;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::{is_atomic_temp_file_for, write_text_atomic};
pub use log_rotation::{append_line_with_rotation, retained_log_files, LogRotationPolicy};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, format_unix_ms_rfc3339,
    is_older_than_unix_ms, parse_rfc3339_unix_ms,
};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn unit_write_text_atomic_writes_content_and_leaves_no_temp_files() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("background_ops.json");
        write_text_atomic(&path, "{\"records\":[]}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"records\":[]}");

        let leftovers = std::fs::read_dir(tempdir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_atomic_temp_file_for(&path, &entry.path()))
            .count();
        assert_eq!(leftovers, 0);
    }
}
