use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use redis::AsyncCommands;
use server::database::{FLEET_KEY, live_fields, live_key};

/// Writes live readings into Redis the way the tracker ingestion path does.
#[derive(Parser)]
struct Cli {
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report a fix for one bin.
    Live {
        bin_id: String,
        latitude: f64,
        longitude: f64,
    },
    /// Report the (0, 0) no-fix sentinel for one bin.
    Offline { bin_id: String },
    /// Report fixes for a fleet of sample bins around Davis, CA.
    Seed {
        #[arg(long, default_value_t = 5)]
        bins: usize,
    },
}

async fn write_live(
    connection: &mut redis::aio::MultiplexedConnection,
    bin_id: &str,
    latitude: f64,
    longitude: f64,
) -> anyhow::Result<()> {
    let timestamp = Utc::now().timestamp_millis();

    let _: () = redis::pipe()
        .atomic()
        .hset_multiple(
            live_key(bin_id),
            &live_fields(latitude, longitude, timestamp),
        )
        .ignore()
        .sadd(FLEET_KEY, bin_id)
        .ignore()
        .query_async(connection)
        .await
        .with_context(|| format!("writing live reading for {bin_id}"))?;

    println!("{bin_id}: ({latitude}, {longitude}) at {timestamp}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let client = redis::Client::open(cli.redis_url.as_str())?;
    let mut connection = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("connecting to {}", cli.redis_url))?;

    match cli.command {
        Command::Live {
            bin_id,
            latitude,
            longitude,
        } => write_live(&mut connection, &bin_id, latitude, longitude).await?,
        Command::Offline { bin_id } => write_live(&mut connection, &bin_id, 0.0, 0.0).await?,
        Command::Seed { bins } => {
            for i in 0..bins {
                let offset = i as f64 * 0.001;
                write_live(
                    &mut connection,
                    &format!("bin-{}", i + 1),
                    38.5382 + offset,
                    -121.7617 - offset,
                )
                .await?;
            }

            let fleet: usize = connection.scard(FLEET_KEY).await?;
            println!("Fleet now has {fleet} bins");
        }
    }

    Ok(())
}
