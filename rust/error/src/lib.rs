// Error codes shared by every stampede crate.  Custom errors map onto these
// codes so callers can handle failures generically without matching on each
// crate's error enum.
use std::error::Error;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // CANCELLED indicates the operation was cancelled (typically by the caller).
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates the caller specified an invalid argument.
    InvalidArgument = 3,
    // DEADLINE_EXCEEDED means the operation expired before completion.
    DeadlineExceeded = 4,
    // NOT_FOUND means some requested entity was not found.
    NotFound = 5,
    // RESOURCE_EXHAUSTED indicates some resource has been exhausted.
    ResourceExhausted = 8,
    // FAILED_PRECONDITION indicates the system is not in a state required for
    // the operation's execution.
    FailedPrecondition = 9,
    // OUT_OF_RANGE means the operation was attempted past the valid range.
    OutOfRange = 11,
    // INTERNAL errors are internal errors.
    Internal = 13,
    // UNAVAILABLE indicates a peer or service is currently unavailable.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::OutOfRange => "OutOfRangeError",
            ErrorCodes::Unavailable => "UnavailableError",
            ErrorCodes::Internal => "InternalError",
            _ => "StampedeError",
        }
    }
}

pub trait StampedeError: Error + Send + Sync {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn StampedeError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl Error for Box<dyn StampedeError> {}

impl StampedeError for Box<dyn StampedeError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl StampedeError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unknown
    }
}
