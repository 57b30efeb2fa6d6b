//! The VM generator (spec §4.4): turns a handler set into runnable x86-64
//! machine code plus its data-section layout.

mod entry_stub;
mod v0;

pub use entry_stub::{EntryStub, ENTRY_STUB_LENGTH};
pub use v0::{generate, GeneratedVm};
