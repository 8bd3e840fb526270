//! Wire envelope and constants for the Ezlo hub local API.
//!
//! The hub speaks JSON-RPC-like messages over a secure WebSocket:
//! requests carry `{id, method, params}`, responses echo the `id` with
//! `{error, result}`, and unsolicited broadcasts arrive with
//! `id = "ui_broadcast"` and a `msg_subclass`.

pub mod constants;
pub mod envelope;

pub use constants::{method, subclass};
pub use envelope::{Message, describe_error};
