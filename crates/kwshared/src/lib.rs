//! Shared Jupyter protocol types for the kernelwire client.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel info reply model
pub mod kernel_info;

/// Kernel execution status types
pub mod kernel_status;

/// Protocol version handling
pub mod protocol_version;
