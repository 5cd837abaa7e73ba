use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "corvid-server", about = "Corvid real-time chat gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/corvid.toml")]
    pub config: String,

    /// Override the bind address from the config file
    #[arg(long)]
    pub bind: Option<String>,
}
