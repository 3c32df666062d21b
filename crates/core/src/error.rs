//! `rmaheap` Error System
//!
//! Every fallible operation returns a `Result`. Domain errors (NUMA backing
//! store, transport registration, device memory) convert into [`HeapError`]
//! so `?` works across layer boundaries.

use thiserror::Error;

/// Heap result type for all operations
pub type HeapResult<T> = Result<T, HeapError>;

/// Result type for NUMA operations
pub type NumaResult<T> = Result<T, NumaError>;

/// Main error type for heap operations
#[derive(Error, Debug)]
pub enum HeapError {
    /// Invalid heap configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message naming the offending fields and values
        message: String,
    },

    /// Backing store failure
    #[error("NUMA error: {0}")]
    Numa(#[from] NumaError),

    /// The backing store placed a segment on a different node than requested
    #[error("Segment requested on node {requested} was placed on node {actual}")]
    WrongNode {
        /// Node the pool serves
        requested: usize,
        /// Node reported by the provider
        actual: usize,
    },

    /// Transport rejected a registration request
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Device memory failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// No pool exists for the node
    #[error("No pool for NUMA node {node}")]
    UnknownNode {
        /// Requested node
        node: usize,
    },

    /// No pool exists for the node and device pair
    #[error("No pool for device {device} on NUMA node {node}")]
    UnknownDevice {
        /// Requested node
        node: usize,
        /// Requested device id
        device: usize,
    },

    /// A device allocation was requested on a heap built without a device provider
    #[error("Device support is disabled for this heap")]
    DeviceSupportDisabled,

    /// Requested size cannot be rounded to a representable power of two
    #[error("Invalid allocation size: {size}")]
    InvalidSize {
        /// Requested size
        size: usize,
    },
}

/// NUMA backing-store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumaError {
    /// NUMA node not available to this process
    #[error("NUMA node {node} not available")]
    NodeNotAvailable {
        /// NUMA node ID
        node: usize,
    },

    /// Allocation failed
    #[error("NUMA allocation failed for size {size} on node {node}: {reason}")]
    AllocationFailed {
        /// Allocation size
        size: usize,
        /// NUMA node ID
        node: usize,
        /// OS-level reason
        reason: String,
    },

    /// Invalid size
    #[error("Invalid allocation size: {size}")]
    InvalidSize {
        /// Invalid size
        size: usize,
    },
}

/// Transport registration failure with transport-specific context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{transport} failed to register {len} bytes at {address:#x}: {reason}")]
pub struct RegistrationError {
    /// Name of the transport backend
    pub transport: &'static str,
    /// Start of the rejected range
    pub address: usize,
    /// Length of the rejected range
    pub len: usize,
    /// Backend diagnostic
    pub reason: String,
}

/// Device memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device allocation failed
    #[error("Device allocation of {size} bytes failed on device {device}")]
    AllocationFailed {
        /// Allocation size
        size: usize,
        /// Device id
        device: usize,
    },

    /// Device id out of range
    #[error("Invalid device id: {device}")]
    InvalidDevice {
        /// Device id
        device: usize,
    },
}

// Convenience constructors for common errors
impl HeapError {
    /// Create configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl RegistrationError {
    /// Create a registration error for `transport`
    pub fn new(
        transport: &'static str,
        address: usize,
        len: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            address,
            len,
            reason: reason.into(),
        }
    }
}
