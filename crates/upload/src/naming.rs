use chrono::{DateTime, TimeZone};

/// Extension of destination objects. Finder expects it to recognize the
/// file type of a sparse disk image.
pub const DEFAULT_EXTENSION: &str = ".sparseimage";

/// Separator between the destination name and a chunk's byte offset.
pub const PART_SEPARATOR: &str = ".part.";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Builds the destination object name from the run's start time.
pub fn destination_name<Tz>(started: &DateTime<Tz>, extension: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{}{extension}", started.format(TIMESTAMP_FORMAT))
}

/// Name of the temporary object holding the chunk that starts at `offset`.
///
/// Deterministic, so a retried chunk overwrites its own earlier attempt.
pub fn chunk_object_name(destination: &str, offset: u64) -> String {
    format!("{destination}{PART_SEPARATOR}{offset}")
}

/// Returns `true` if `name` looks like a temporary chunk object.
pub fn is_chunk_object(name: &str) -> bool {
    match name.rsplit_once(PART_SEPARATOR) {
        Some((base, offset)) => {
            !base.is_empty() && !offset.is_empty() && offset.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
