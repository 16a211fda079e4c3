//! KCP reliable ordered transport: protocol engine and connection plumbing.
//! Host-driven: no I/O; the host supplies timestamps, inbound datagrams and an output sink.

pub mod config;
pub mod connection;
pub mod engine;
pub mod fec;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod segment;
pub mod seq;
pub mod session;
pub mod stats;
pub mod wire;

pub use config::{ChannelConfig, ConfigError, Mode};
pub use connection::{random_conv, CloseReason, Connection, Mailbox, Tick, WakeFlag, WriteError};
pub use engine::{InputError, Kcp, Output, RecvError, SendError};
pub use fec::{FecCodec, FecError, NoFec, ParityFec};
pub use scheduler::TimerQueue;
pub use session::{SessionKey, SessionManager, Strategy};
pub use stats::Stats;
