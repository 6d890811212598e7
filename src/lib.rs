pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod versionmap;
