//! EtherNet/IP: encapsulation framing, the Common Packet Format, and a
//! session-oriented TCP/UDP server fronting a [`cip::Device`].

pub mod command;
pub mod config;
pub mod cpf;
pub mod frame;
pub mod server;
pub mod session;

pub use server::{serve, Options};
pub use session::{Activity, Session, Sessions};

/// Default EtherNet/IP port.
pub const DEFAULT_PORT: u16 = 44818;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad frame: {reason}")]
    Frame { reason: String },

    #[error(transparent)]
    Cip(#[from] cip::Error),

    #[error(transparent)]
    Dict(#[from] dict::Error),

    #[error(transparent)]
    Automata(#[from] automata::Error),
}
