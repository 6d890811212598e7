pub mod file_namespace;
pub mod page_manager;

pub use file_namespace::FileNamespace;
pub use page_manager::{PageManager, PAGE_SIZE};
