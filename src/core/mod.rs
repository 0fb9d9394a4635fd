pub mod cluster;
pub mod convert;
pub mod duplicate;
pub mod exif;
pub mod fingerprint;
pub mod hash;
pub mod import;
pub mod merge;
pub mod schedule;
pub mod store;
