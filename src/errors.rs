use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the HLS egress service.
#[derive(Debug, Error)]
pub enum HlsError {
    #[error("Path not found: {path_name}")]
    PathNotFound { path_name: String },

    #[error("Path already published: {path_name}")]
    PathAlreadyPublished { path_name: String },

    #[error("unable to find a video or audio track")]
    NoMediaTracks,

    #[error("can't read track {index}: too many tracks")]
    TooManyTracks { index: usize },

    #[error("Codec error: {message}")]
    CodecError { message: String },

    #[error("Mux error: {message}")]
    MuxError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("stream closed")]
    StreamClosed,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<config::ConfigError> for HlsError {
    fn from(err: config::ConfigError) -> Self {
        HlsError::ConfigError {
            message: err.to_string(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for HlsError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        HlsError::InternalError {
            message: format!("Channel send error: {}", err),
        }
    }
}

impl HlsError {
    pub fn error_code(&self) -> &'static str {
        match self {
            HlsError::PathNotFound { .. } => "PATH_NOT_FOUND",
            HlsError::PathAlreadyPublished { .. } => "PATH_ALREADY_PUBLISHED",
            HlsError::NoMediaTracks => "NO_MEDIA_TRACKS",
            HlsError::TooManyTracks { .. } => "TOO_MANY_TRACKS",
            HlsError::CodecError { .. } => "CODEC_ERROR",
            HlsError::MuxError { .. } => "MUX_ERROR",
            HlsError::ConfigError { .. } => "CONFIG_ERROR",
            HlsError::NetworkError { .. } => "NETWORK_ERROR",
            HlsError::StreamClosed => "STREAM_CLOSED",
            HlsError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            HlsError::PathNotFound { .. } => StatusCode::NOT_FOUND,
            HlsError::PathAlreadyPublished { .. } => StatusCode::CONFLICT,
            HlsError::NoMediaTracks => StatusCode::NOT_FOUND,
            HlsError::TooManyTracks { .. } => StatusCode::NOT_FOUND,
            HlsError::CodecError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            HlsError::MuxError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            HlsError::ConfigError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            HlsError::NetworkError { .. } => StatusCode::BAD_GATEWAY,
            HlsError::StreamClosed => StatusCode::GONE,
            HlsError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that end the whole client, as opposed to a single packet or request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HlsError::CodecError { .. })
    }
}

pub type Result<T> = std::result::Result<T, HlsError>;
