//! Local IPC between the session coordinator and its peers.
//!
//! Uses length-prefixed JSON frames over a Unix domain socket.
//!
//! # Architecture
//!
//! - **Server**: runs in the coordinator, owns the session table, answers every peer
//! - **Client**: runs in each worker, forwards session operations to the coordinator
//! - **Protocol**: framing and message types shared by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::PeerClient;
pub use protocol::{Operation, Request, Response, Status};
pub use server::{Coordinator, CoordinatorHandle};
