//! STARTTLS broker: terminates port-25 TLS upgrades in front of the MTA
//! when `smtp.enabled` is set. Commands before the upgrade are answered
//! locally; after the handshake the session is relayed to the upstream
//! MTA command by command.

mod connection;
pub mod server;
mod session;

pub use server::SmtpBroker;
