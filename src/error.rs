//! Small error-handling helpers shared across the crate.

/// Extension for call sites that tolerate failures by logging them.
///
/// Background loops (directory refresh, snapshot, cleanup) log transient
/// failures and continue; these adapters keep those sites terse.
pub trait ResultOkLogExt<T, E> {
    /// Logs the error at `error` level and discards it.
    fn ok_log(self) -> Option<T>;

    /// Logs the error at `warn` level and discards it. For transient
    /// failures the next loop iteration is expected to recover from.
    fn ok_warn(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    fn ok_warn(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::warn!("{err}");
                None
            }
        }
    }
}
