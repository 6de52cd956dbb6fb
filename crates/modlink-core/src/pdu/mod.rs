//! Protocol data units: the function code and its data, independent of transport.

pub mod exception;
pub mod function_code;
pub mod payload;
pub mod request;
pub mod response;

pub use exception::{ExceptionCode, ExceptionResponse};
pub use function_code::{FunctionCode, Table};
pub use payload::{PackedBits, WireWords};
pub use request::*;
pub use response::*;

/// Largest PDU any transport carries.
pub const MAX_PDU_LEN: usize = 253;
