//! Storage drivers that own the backend storage of each layer.

mod traits;
mod vfs;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use traits::*;
pub use vfs::*;
