use thiserror::Error;

/// Single error-kind enumeration for everything that can abort startup.
///
/// In-loop failures (short writes, radio read errors, parser desync,
/// stale host metrics) are logged and swallowed at the call site instead
/// of being routed through this type — the loop never unwinds.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("could not open radio socket on adapter '{adapter}': {source}")]
    RadioOpen {
        adapter: String,
        #[source]
        source: std::io::Error,
    },
}

pub type DbResult<T> = Result<T, DbError>;
