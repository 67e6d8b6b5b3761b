//! Wire framing and the cross-proclet argument codec (§6, §9).

pub mod codec;
pub mod frame;

pub use codec::{decode_value, encode_value, install_ref_counter, PassAcrossProclet, ProcletHandle, ProcletRefCounter, WireError};
pub use frame::{read_frame, write_frame, FrameError, MigrationOpcode, RequestKind};
