//! hvport: Hypervisor Control Plane
//!
//! Exposes the Unix VMM ioctl surface (create a VM, add VCPUs, map guest
//! memory, get and set registers, run) as buffered control requests on a
//! device session, on top of a pluggable virtualization engine.
//!
//! # Key Features
//!
//! - **Descriptor tables**: generation-checked VM and VCPU handles per session
//! - **Fixed wire protocol**: `#[repr(C)]` requests from [`hvport_protocol`]
//! - **Pinned memory maps**: guest frame ranges backed by locked host pages
//! - **Engines**: a portable software engine and, on Linux, `/dev/kvm`
//!
//! # Example
//!
//! ```no_run
//! use hvport::{protocol::ControlCode, Driver, DriverConfig};
//!
//! fn main() -> hvport::Result<()> {
//!     let driver = Driver::soft(DriverConfig::default())?;
//!     let mut session = driver.open()?;
//!
//!     let mut out = [0u8; 4];
//!     let completion = session.control(ControlCode::CreateVm.code(), &[], &mut out);
//!     assert!(completion.is_success());
//!     println!("VM descriptor: {}", i32::from_le_bytes(out));
//!
//!     session.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memmap;
pub mod resource;
pub mod session;
pub mod trampoline;

pub use hvport_protocol as protocol;

// Re-exports for convenience
pub use config::DriverConfig;
pub use dispatch::Completion;
pub use error::{Error, Result};
pub use session::{Driver, Session};
