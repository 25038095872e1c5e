//! htsp-probe: connect to an HTSP backend and print what it announces.
//!
//! Logs in, waits for the initial sync and prints the channel list,
//! optionally followed by the EPG events of one channel.

use std::path::PathBuf;

use chrono::{Local, TimeZone, Utc};
use clap::Parser;
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use htsp_client::{ChannelInfo, ConnectionRegistry};
use htsp_protocol::{Field, Message};

mod config;
mod logging;

use config::{load_config, ConfigFile};

const DEFAULT_CONFIG_FILE: &str = "htsp-probe.toml";

/// htsp-probe - list channels and EPG events of an HTSP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Server host name or address
    #[arg(long)]
    host: Option<String>,

    /// HTSP port
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Registry key of the server target
    #[arg(long, default_value = "default")]
    target: String,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Also list the EPG events of this channel id
    #[arg(short, long)]
    events: Option<i64>,

    /// EPG window in hours
    #[arg(long, default_value = "24")]
    hours: i64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > ./htsp-probe.toml > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    // Command line takes precedence over the file.
    let mut conn_config = file_config.server.to_connection_config();
    if let Some(host) = args.host.clone() {
        conn_config.host = host;
    }
    if let Some(port) = args.port {
        conn_config.htsp_port = port;
    }
    if let Some(username) = args.username.clone() {
        conn_config.username = username;
    }
    if let Some(password) = args.password.clone() {
        conn_config.password = password;
    }

    let registry = ConnectionRegistry::new();
    let supervisor = registry.get_or_create(&args.target, || conn_config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted");
                cancel.cancel();
            }
        });
    }

    info!(
        "Probing {}:{}",
        supervisor.config().host,
        supervisor.config().htsp_port
    );

    let result = run(&args, &supervisor, &cancel).await;
    registry.stop_all();
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

async fn run(
    args: &Args,
    supervisor: &htsp_client::ConnectionSupervisor,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let channels = supervisor.get_channels(cancel).await?;
    info!("{} channels", channels.len());
    print_channels(&channels, args.json)?;

    if let Some(channel_id) = args.events {
        let max_time = Utc::now().timestamp() + args.hours * 3600;
        let events = supervisor.get_events(channel_id, max_time, cancel).await?;
        info!("{} events on channel {}", events.len(), channel_id);
        print_events(&events, args.json)?;
    }

    Ok(())
}

fn print_channels(channels: &[ChannelInfo], as_json: bool) -> serde_json::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(channels)?);
        return Ok(());
    }

    for channel in channels {
        println!(
            "{:>8}  {:<6} {:<5} {}{}",
            channel.id,
            channel.number,
            format!("{:?}", channel.channel_type),
            channel.name,
            channel
                .image_url
                .as_deref()
                .map(|url| format!("  [{}]", url))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_events(events: &[Message], as_json: bool) -> serde_json::Result<()> {
    if as_json {
        let events: Vec<Value> = events.iter().map(message_to_json).collect();
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    for event in events {
        let title = event.get_str("title").unwrap_or("(untitled)");
        let start = event.get_int("start").ok().map(format_time);
        let stop = event.get_int("stop").ok().map(format_time);
        println!(
            "{} - {}  {}",
            start.as_deref().unwrap_or("?"),
            stop.as_deref().unwrap_or("?"),
            title
        );
    }
    Ok(())
}

fn format_time(unix_secs: i64) -> String {
    match Local.timestamp_opt(unix_secs, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => unix_secs.to_string(),
    }
}

/// Byte strings become text when they are UTF-8, byte arrays otherwise.
fn message_to_json(message: &Message) -> Value {
    let mut object = Map::new();
    for (name, field) in message.iter() {
        object.insert(name.to_string(), field_to_json(field));
    }
    Value::Object(object)
}

fn field_to_json(field: &Field) -> Value {
    match field {
        Field::Int(v) => json!(v),
        Field::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => json!(s),
            Err(_) => json!(b.to_vec()),
        },
        Field::Map(m) => message_to_json(m),
        Field::List(l) => Value::Array(l.iter().map(message_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htsp_protocol::MessageBuilder;

    #[test]
    fn test_message_to_json() {
        let message = MessageBuilder::new()
            .field("eventId", 12)
            .field("title", "News")
            .field("raw", vec![0xFFu8, 0x00])
            .field(
                "genre",
                vec![MessageBuilder::new().field("code", 32).build()],
            )
            .build();

        assert_eq!(
            message_to_json(&message),
            json!({
                "eventId": 12,
                "title": "News",
                "raw": [255, 0],
                "genre": [{"code": 32}],
            })
        );
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "htsp-probe",
            "--host",
            "tvh.local",
            "-p",
            "9983",
            "--events",
            "7",
            "--json",
        ]);
        assert_eq!(args.host.as_deref(), Some("tvh.local"));
        assert_eq!(args.port, Some(9983));
        assert_eq!(args.events, Some(7));
        assert_eq!(args.hours, 24);
        assert_eq!(args.target, "default");
        assert!(args.json);
    }
}
