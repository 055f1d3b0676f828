//! Physical memory and address spaces
//!
//! [`FrameTable`] owns every physical page and its reference count;
//! [`AddressSpace`] is one process's page directory and page tables over it.

pub mod frame_metadata;
pub mod page_table;

pub use frame_metadata::FrameTable;
pub use page_table::{AddressSpace, Pte};
