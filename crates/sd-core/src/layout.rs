//! On-disk layout of a storage directory.
//!
//! ```text
//! <sd>/SD_ID                         uuid of the storage directory
//! <sd>/notes/<noteId>/...            opaque document directory
//! <sd>/notes/.moving-<noteId>/...    staging directory of an in-flight move
//! <sd>/notes/.replaced-<noteId>/...  resident document set aside by a replacing move
//! <sd>/notes/.promoting-<noteId>     marker of a copy from staging in progress
//! <sd>/.migration-lock               schema migration lock marker
//! <sd>/activity/<instanceId>.log     per-device activity log
//! ```

use crate::fs::join;

pub const SD_ID_FILE: &str = "SD_ID";
pub const NOTES_DIR: &str = "notes";
pub const STAGING_PREFIX: &str = ".moving-";
pub const DISPLACED_PREFIX: &str = ".replaced-";
pub const PROMOTION_MARKER_PREFIX: &str = ".promoting-";
pub const MIGRATION_LOCK_FILE: &str = ".migration-lock";
pub const ACTIVITY_DIR: &str = "activity";
pub const ACTIVITY_LOG_EXT: &str = ".log";

pub fn identity_file(sd_path: &str) -> String {
    join(sd_path, SD_ID_FILE)
}

pub fn notes_dir(sd_path: &str) -> String {
    join(sd_path, NOTES_DIR)
}

pub fn note_dir(sd_path: &str, note_id: &str) -> String {
    join(&notes_dir(sd_path), note_id)
}

/// Staging directory for a note being moved into `sd_path`.
pub fn staging_dir(sd_path: &str, note_id: &str) -> String {
    join(&notes_dir(sd_path), &format!("{}{}", STAGING_PREFIX, note_id))
}

/// Where the resident document waits while a replacing move is placed.
pub fn displaced_dir(sd_path: &str, note_id: &str) -> String {
    join(&notes_dir(sd_path), &format!("{}{}", DISPLACED_PREFIX, note_id))
}

/// Present while staging is copied (not renamed) to the final name; the
/// final directory then may hold a partial copy.
pub fn promotion_marker(sd_path: &str, note_id: &str) -> String {
    join(&notes_dir(sd_path), &format!("{}{}", PROMOTION_MARKER_PREFIX, note_id))
}

/// Entries under `notes/` that are never finished notes (staging, hidden files).
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('.')
}

pub fn migration_lock(sd_path: &str) -> String {
    join(sd_path, MIGRATION_LOCK_FILE)
}

pub fn activity_dir(sd_path: &str) -> String {
    join(sd_path, ACTIVITY_DIR)
}

pub fn activity_log(sd_path: &str, instance: &str) -> String {
    join(&activity_dir(sd_path), &format!("{}{}", instance, ACTIVITY_LOG_EXT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_dir_is_marker_prefixed_sibling() {
        assert_eq!(note_dir("/sds/b", "n1"), "/sds/b/notes/n1");
        assert_eq!(staging_dir("/sds/b", "n1"), "/sds/b/notes/.moving-n1");
        assert!(is_reserved_name(".moving-n1"));
        assert_eq!(displaced_dir("/sds/b", "n1"), "/sds/b/notes/.replaced-n1");
        assert_eq!(promotion_marker("/sds/b", "n1"), "/sds/b/notes/.promoting-n1");
        assert!(is_reserved_name(".replaced-n1"));
        assert!(!is_reserved_name("n1"));
    }

    #[test]
    fn test_housekeeping_paths() {
        assert_eq!(migration_lock("/sds/a"), "/sds/a/.migration-lock");
        assert_eq!(activity_log("/sds/a", "00ff"), "/sds/a/activity/00ff.log");
        assert_eq!(identity_file("/sds/a/"), "/sds/a/SD_ID");
    }
}
