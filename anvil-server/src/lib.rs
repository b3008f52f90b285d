//! The anvild daemon: framed job/cache RPC services over an
//! `anvil_core::Engine`.

pub mod rpc;
