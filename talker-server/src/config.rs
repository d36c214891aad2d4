//! Command-line configuration. Nothing is persisted; a server's whole world
//! lives in memory and on its sockets.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "talker-server", about = "Distributed talker server")]
pub struct ServerConfig {
    /// Port the client listener binds.
    #[arg(long, default_value_t = 8889)]
    pub port: u16,

    /// Address the client listener binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Explicit peer id. A random 20-hex-char id is generated when absent;
    /// operators wiring meshes by hand usually pass short memorable ids.
    #[arg(long)]
    pub id: Option<String>,

    /// Require users to log in before speaking.
    #[arg(long)]
    pub auth: bool,
}

impl ServerConfig {
    /// Defaults without touching the process arguments, for tests.
    pub fn for_port(port: u16) -> Self {
        Self {
            port,
            host: "127.0.0.1".to_string(),
            id: None,
            auth: false,
        }
    }
}
