//! IPC module for daemon-client communication

mod protocol;
mod server;

pub use protocol::{
    read_message, write_message, ClientReply, DaemonStatus, Notification, Request, Response,
    MAX_MESSAGE_LEN,
};
pub use server::Server;
