//! Virtual machine management
//!
//! - `client`: the REST client for the VM API
//! - `tracker`: follows background tasks (UPIDs) to a verdict
//! - `workflow`: clone and provisioning sequences
//! - `connect`: SPICE and SSH console access

mod client;
mod tracker;
mod workflow;
mod connect;

pub use client::{CloneRequest, PowerAction, VmApi, VmClient};
pub use tracker::{
    interpret_log_line, LogLine, NoProgress, ProgressSink, TaskHandle, TaskOutcome, TaskSource,
    TaskStatus, TaskTracker, TerminalState,
};
pub use workflow::{Provisioner, Resources};
pub use connect::{connect, first_interface_ip, ssh_args, viewer_file_contents, Protocol};
