//! Converting `tonic::Status` into [`StreamchatError`].

use tonic::{Code, Status};

use streamchat_types::StreamchatError;

/// Converts a status received from the peer into a workspace error.
///
/// Authorization rejections keep their own variants so callers can
/// tell them apart from transport trouble.
pub fn status_to_error(status: Status) -> StreamchatError {
    let code = status.code();
    let msg = status.message();

    match code {
        Code::Unauthenticated => StreamchatError::Unauthenticated {
            reason: msg.to_string(),
        },
        Code::PermissionDenied => StreamchatError::PermissionDenied {
            reason: msg.to_string(),
        },
        Code::Unavailable => StreamchatError::Transport {
            reason: format!("server unavailable ({msg})"),
        },
        Code::DeadlineExceeded => StreamchatError::Transport {
            reason: format!("request timed out ({msg})"),
        },
        Code::Cancelled => StreamchatError::Session {
            reason: format!("call cancelled ({msg})"),
        },
        _ => StreamchatError::Session {
            reason: format!("rpc error [{code}]: {msg}"),
        },
    }
}

/// Wraps a tonic transport failure.
pub fn transport_error(err: tonic::transport::Error) -> StreamchatError {
    StreamchatError::Transport {
        reason: err.to_string(),
    }
}
