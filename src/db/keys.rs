//! Storage key layout. Read-side consumers depend on these names.

pub const CURSOR_LAST_SEEN: &str = "cursor:last-seen-post";
pub const SESSION_BLOB: &str = "session:credential-blob";
/// Hash of filter name -> bound author handle (empty = unbound).
pub const FILTERS: &str = "config:filters";

pub fn records(filter: &str) -> String {
    format!("records:{}", filter)
}

pub fn dedup(filter: &str) -> String {
    format!("dedup:{}", filter)
}
