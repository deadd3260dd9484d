use thiserror::Error;

/// Synchronous failures of the user-facing send API. Wire-level and
///  protocol-level problems never surface here - they are absorbed into
///  session state and the [`EventDispatcher`](crate::EventDispatcher)
///  lifecycle events.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("payload of {actual} bytes exceeds the maximum transfer size of {max} bytes")]
    PayloadTooLarge { actual: usize, max: usize },

    #[error("endpoint is closed")]
    Closed,

    #[error("no destination: no peer given and no default peer configured")]
    NoDestination,
}
