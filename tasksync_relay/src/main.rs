use clap::Parser;
use tasksync_relay::{DEFAULT_DATABASE, DEFAULT_LISTEN, Relay, RelayConfig};

/// WebSocket relay for tasksync clients
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to accept WebSocket clients on
    #[arg(long, env = "TASKSYNC_RELAY_LISTEN", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// SeaORM database URL for the relay's task table
    #[arg(long, env = "TASKSYNC_RELAY_DATABASE", default_value = DEFAULT_DATABASE)]
    database: String,

    /// User id stamped on outgoing tasks
    #[arg(long, env = "TASKSYNC_USER_ID", default_value = tasksync::DEFAULT_USER_ID)]
    user_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let relay = Relay::bind(&RelayConfig {
        listen: args.listen,
        database: args.database,
        user_id: args.user_id,
    })
    .await?;

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
