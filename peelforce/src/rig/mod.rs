pub mod connection;
pub mod port;
pub mod proto;
pub mod router;
pub mod util;

pub use connection::{Commander, ConnectError, ConnectSettings, Connection, ConnectionState, Event};
pub use port::{RecvError, SendError};
pub use proto::{Command, CommandError, TelemetryLine};
pub use router::{Claim, Router, Target};
