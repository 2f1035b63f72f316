pub mod archive;
pub mod locations;

pub use archive::{ArchivedReading, RawArchive};
pub use locations::{DeviceLocation, LocationTable};
