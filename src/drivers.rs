//! Platform drivers for the capability traits.

pub mod reqwest_client;
pub mod sysfs_link;
pub mod virtual_matrix;

pub use reqwest_client::ReqwestClient;
pub use sysfs_link::SysfsLink;
pub use virtual_matrix::VirtualMatrix;
