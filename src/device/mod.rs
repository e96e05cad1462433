// Target device discovery
//
// - catalog.rs: block device enumeration and size-signature filtering

pub mod catalog;


pub use catalog::{
    select_single, CapacityBand, Device, DeviceCatalog, DeviceEnumerator, PhysicalDisk,
    SysfsEnumerator, GIB,
};
