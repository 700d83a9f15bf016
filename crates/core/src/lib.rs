pub mod client;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, build, build_with_transport};
pub use error::{DecodeErrorKind, Result, RetsError};
pub use protocol::{CompactResult, LoginResponse, LogoutResponse, ResponseBlock, XmlReader};
pub use session::Session;
pub use transport::{Context, Credentials, Requester, Transport};
