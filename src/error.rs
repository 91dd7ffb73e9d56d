// Error types for the selection engine.
//
// Only failures the host can act on surface here. Parse failures never do
// (they degrade to a <parse_error> pseudo-block), and per-file I/O errors
// during change detection degrade to the "deleted" bucket with a warning.

use std::path::PathBuf;

/// Top-level error enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Schema mismatch or an unreadable checksum blob. The store refuses
    /// to read; the host should rebuild with a forced baseline.
    #[error("store corrupt: {0} (rebuild with a forced baseline)")]
    StoreCorrupt(String),

    /// The 30-second busy timeout elapsed while another writer held the
    /// store. Fatal for the current operation; the host may retry.
    #[error("store contention: busy timeout elapsed")]
    Contention,

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            match e.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return Error::Contention
                }
                rusqlite::ErrorCode::NotADatabase => {
                    return Error::StoreCorrupt("file is not a database".to_string())
                }
                _ => {}
            }
        }
        Error::Sqlite(err)
    }
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_contention() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(Error::from(busy), Error::Contention));
    }

    #[test]
    fn other_sqlite_errors_pass_through() {
        let err = rusqlite::Error::InvalidQuery;
        assert!(matches!(Error::from(err), Error::Sqlite(_)));
    }
}
