//! Appliers that turn a layer payload into files inside a layer directory.

mod archive;
mod service_vm;
mod traits;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;
pub use service_vm::*;
pub use traits::*;
