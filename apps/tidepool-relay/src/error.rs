use thiserror::Error;
use tidepool_proto::MessageType;

/// Why the relay dropped a frame. None of these are fatal to the relay or
/// to the connection that sent the frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("{0} frame has no streamId")]
    MissingStreamId(MessageType),
    #[error("{0} frame has no target")]
    MissingTarget(MessageType),
    #[error("WatchStream frame names no watcher and the connection never signed in")]
    UnknownWatcher,
    #[error("no endpoint registered as `{0}`")]
    UnknownTarget(String),
    #[error("endpoint `{0}` disconnected before delivery")]
    TargetClosed(String),
    #[error("{0} is relay-originated and cannot be sent by an endpoint")]
    NotRoutable(MessageType),
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::MissingStreamId(_) => "missing_stream_id",
            RouteError::MissingTarget(_) => "missing_target",
            RouteError::UnknownWatcher => "unknown_watcher",
            RouteError::UnknownTarget(_) => "unknown_target",
            RouteError::TargetClosed(_) => "target_closed",
            RouteError::NotRoutable(_) => "not_routable",
        }
    }
}
