//! Wire protocol of the control socket, and a client for it.
//!
//! The protocol is line-oriented text: a header naming the command and the
//! set, optional domain lines for `update`, and a blank line (or EOF) as the
//! request terminator. One request per connection.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{ControlClient, DEFAULT_CTL_PATH};
pub use error::{ControlError, Result};
pub use protocol::{Command, MAX_SET_NAME_LEN, ParseError, Request, RequestParser};
