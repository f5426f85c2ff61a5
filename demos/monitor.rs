//! Connect to an amplifier, print state changes and accept simple commands.
//!
//! ```text
//! cargo run --example monitor -- 192.168.1.50 [port]
//! ```
//!
//! Commands on stdin: `power on|off`, `mute on|off`, `vol <n>`, `source <name>`,
//! `refresh`, `state`, `quit`.

use rotel_ip::{Session, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rotel_ip=info")))
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().ok_or("usage: monitor <host> [port]")?;
    let mut config = SessionConfig::new(host);
    if let Some(port) = args.next() {
        config = config.with_port(port.parse()?);
    }

    let session = Session::new(config)?;
    let mut changes = session.subscribe_changes();
    let mut status = session.subscribe_status();
    session.start()?;

    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            println!("{:?}: {:?} -> {:?}", change.field, change.old, change.new);
        }
    });
    tokio::spawn(async move {
        while let Ok(status) = status.recv().await {
            println!("status: {:?}", status);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        let result = match words.as_slice() {
            ["power", "on"] => session.set_power(true).await,
            ["power", "off"] => session.set_power(false).await,
            ["mute", "on"] => session.set_mute(true).await,
            ["mute", "off"] => session.set_mute(false).await,
            ["vol", value] => match value.parse() {
                Ok(volume) => session.set_volume(volume).await,
                Err(_) => {
                    println!("not a volume: {}", value);
                    continue;
                }
            },
            ["source", name] => session.set_source(name).await,
            ["refresh"] => session.refresh().await,
            ["state"] => {
                println!("{:#?}", session.get_state());
                continue;
            }
            ["quit"] => break,
            [] => continue,
            _ => {
                let profile = session.profile();
                let sources: Vec<&str> = profile.source_names().collect();
                println!("unknown command (sources: {})", sources.join(", "));
                continue;
            }
        };

        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    session.shutdown().await;
    Ok(())
}
