//! iPXE artifacts: the binary set served over TFTP/HTTP and the
//! per-machine boot script.

pub mod binary;
pub mod script;

pub use binary::IpxeBinaries;
pub use script::ScriptRenderer;
