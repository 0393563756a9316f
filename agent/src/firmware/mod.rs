pub mod device;
pub mod installer;
pub mod slot;
