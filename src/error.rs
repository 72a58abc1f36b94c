/// Error types shared across the crate.
///
/// Receive-path parse failures are recovered locally (frame dropped, debug
/// log); these variants surface on the control paths: scan completion,
/// state transitions, and the socket-facing send call.
use thiserror::Error;

/// Status returned by the radio driver's control and send entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// The driver cannot take more work right now. The send path swallows
    /// this: the remaining frames of the batch are freed and the call
    /// reports success.
    ResourceInUse,
    /// The request is not supported by the hardware.
    NotSupported,
    /// The driver failed the request.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A reply did not arrive inside the state-timer window.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// Unsupported cipher, AKM, or rate set.
    #[error("peer requires an unsupported cipher, AKM, or rate")]
    NotSupported,

    /// A frame or element was shorter than its declared or required length.
    #[error("frame length inconsistent with contents")]
    DataLengthMismatch,

    /// A reply arrived from an address other than the one joined.
    #[error("reply from an unexpected address")]
    InvalidAddress,

    /// An allocation or queue-capacity limit was hit.
    #[error("out of resources")]
    OutOfResources,

    /// RSN information element version other than 1.
    #[error("RSN version mismatch")]
    VersionMismatch,

    /// The peer reported a non-success status, or the operation cannot
    /// proceed in the current link state.
    #[error("operation unsuccessful")]
    Unsuccessful,

    /// The access point changed its parameters mid-operation.
    #[error("operation cancelled")]
    OperationCancelled,

    /// The network is encrypted and no passphrase was supplied.
    #[error("access denied: encrypted network requires a passphrase")]
    AccessDenied,

    /// The driver refused a control or send request.
    #[error("driver reported {0:?}")]
    Driver(DriverStatus),
}

pub type Result<T> = core::result::Result<T, Error>;
