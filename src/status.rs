//! gRPC status rendering for the host.

use tonic::{Code, Status};

/// Message attached to caller-initiated cancellation.
pub const CANCELLED_MESSAGE: &str = "Cancelled";

/// Canonical upper-case name of a status code.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Human-readable description of a terminal status.
///
/// Formatted as `CODE: message`, or just `CODE` when the status carries no
/// message.
pub fn describe(status: &Status) -> String {
    let name = code_name(status.code());
    if status.message().is_empty() {
        name.to_string()
    } else {
        format!("{}: {}", name, status.message())
    }
}

/// Status reported for a call cancelled by the host.
pub fn cancelled() -> Status {
    Status::cancelled(CANCELLED_MESSAGE)
}

/// Status reported for a call whose deadline passed before it closed.
pub fn deadline_exceeded(after: std::time::Duration) -> Status {
    Status::deadline_exceeded(format!("deadline exceeded after {:?}", after))
}

/// Successful terminal status.
pub fn ok() -> Status {
    Status::new(Code::Ok, "")
}
