pub mod aperture;
pub mod device;
pub mod doorbell;
pub mod ioctl;
pub mod pasid;
pub mod qcm;
pub mod sysfs;

pub use device::{GpuId, KfdDevice};
pub use sysfs::Procfs;
