pub mod client;
pub mod mail_info;
pub mod protocol;

/// File name of the control socket inside its runtime directory.
pub const DEFAULT_SOCKET_NAME: &str = "pinger.sock";
