//! Shared vocabulary types for the data server: status codes, the `Status`
//! error value, block and file-system identifiers, and server addresses.

#[allow(non_snake_case)]
pub mod status_code;

pub mod result;
pub mod status;

#[macro_use]
pub mod strong_type;

pub mod address;
pub mod ids;

// Re-export commonly used items at the crate root.
pub use address::{AddressParseError, ServerAddress};
pub use ids::*;
pub use result::{make_error, make_error_msg, Result};
pub use status::Status;
pub use status_code::*;
