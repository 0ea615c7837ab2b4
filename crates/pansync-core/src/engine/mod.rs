//! Transfer engines
//!
//! - Chunked, resumable uploads with session refresh
//! - Segmented downloads with one reusable link per worker
//! - Session persistence (SQLite or in-memory)

mod download;
mod persistence;
mod segment_worker;
mod upload;

pub use download::*;
pub use persistence::*;
pub use segment_worker::*;
pub use upload::*;

/// `path` relative to `dir`, or `None` if it is not strictly below it
pub fn relative_path<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let dir = dir.trim_end_matches('/');
    path.strip_prefix(dir)?
        .strip_prefix('/')
        .filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::relative_path;

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("/apps/bypy/x", "/apps/bypy/x/a/b.txt"), Some("a/b.txt"));
        assert_eq!(relative_path("/apps/bypy/x/", "/apps/bypy/x/a"), Some("a"));
        assert_eq!(relative_path("/apps/bypy/x", "/apps/bypy/xy/a"), None);
        assert_eq!(relative_path("/apps/bypy/x", "/apps/bypy/x"), None);
    }
}
