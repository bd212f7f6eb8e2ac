/*!
 * Built-in device implementations.
 */

pub mod linux;
pub mod lxd;

pub use linux::LinuxShell;
pub use lxd::LxdPdu;
