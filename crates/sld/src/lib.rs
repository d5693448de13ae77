//! sld - a static ELF32 loader.
//!
//! Maps the loadable segments of a fixed-address i386 executable into the
//! current process and jumps to its entry point. No dynamic linking, no
//! relocation.
//!
//! # Example
//!
//! ```ignore
//! use sld::{Loader, NativeTransfer, Reporter};
//!
//! let loader = Loader::new("hello.elf", vec![]);
//! let err = loader.run(&mut Reporter::stdout(), &mut NativeTransfer::default());
//! ```

mod error;
mod loader;
mod report;
mod startup;
mod transfer;

pub use error::{Error, Result};
pub use loader::{LoadStage, Loader, Prepared};
pub use report::{Reporter, TABLE_HEADER};
pub use startup::{StackError, StackImage, StartupInfo};
pub use transfer::{
    ControlTransfer, DEFAULT_STACK_SIZE, NativeTransfer, RecordingTransfer, TransferError,
};

pub use sld_elf::{ElfError, ElfImage};
pub use sld_map::{MapError, PageSize};
