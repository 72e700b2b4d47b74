//! Command line argument parsing.

use clap::{Parser, Subcommand};

#[derive(Parser, Clone)]
pub struct SharedOpts {
    #[clap(short, long, help = "Configuration file")]
    pub config: Option<String>,
    #[clap(short, long, help = "TSIG secret file, required to accept UPDATE requests")]
    pub secret: Option<String>,
    #[clap(short, long, help = "Enable debug logging")]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server. The default command if none is given.
    Server {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Load and validate the configuration file, without starting the server.
    ConfigCheck {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Print the effective configuration, with defaults filled in, as TOML.
    ExportConfig {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Server {
            sopt: SharedOpts {
                config: None,
                secret: None,
                debug: false,
            },
        }
    }
}

#[derive(Parser)]
#[command(arg_required_else_help(false))]
/// A small authoritative DNS name server.
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    fn command(&self) -> Commands {
        match &self.command {
            Some(Commands::Server { sopt }) => Commands::Server { sopt: sopt.clone() },
            Some(Commands::ConfigCheck { sopt }) => Commands::ConfigCheck { sopt: sopt.clone() },
            Some(Commands::ExportConfig { sopt }) => Commands::ExportConfig { sopt: sopt.clone() },
            None => Commands::default(),
        }
    }

    pub fn config(&self) -> Option<String> {
        sopt(&self.command()).config.clone()
    }

    pub fn secret(&self) -> Option<String> {
        sopt(&self.command()).secret.clone()
    }

    pub fn debug(&self) -> bool {
        sopt(&self.command()).debug
    }
}

fn sopt(command: &Commands) -> &SharedOpts {
    match command {
        Commands::Server { sopt } | Commands::ConfigCheck { sopt } | Commands::ExportConfig { sopt } => sopt,
    }
}
