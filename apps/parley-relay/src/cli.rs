use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Signaling relay and credential service for parley peers")]
pub struct Cli {
    /// Port to listen on (overrides PARLEY_RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to the credential file (overrides PARLEY_USERS_FILE)
    #[arg(long)]
    pub users_file: Option<String>,
}
