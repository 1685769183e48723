use std::{path::PathBuf, time::Duration};

use clap::Parser;
use cue_remote::{ConnectionSettings, SessionSettings, SessionState, TransportKind, UiEvent, start_session};

#[derive(Parser, Debug)]
#[command(about = "Mirror a show-control workspace over OSC")]
struct Args {
    /// Server host name or address
    host: String,

    /// Server OSC port
    #[arg(short, long, default_value_t = 53000)]
    port: u16,

    /// Use SLIP-framed TCP instead of UDP
    #[arg(long)]
    tcp: bool,

    #[arg(long)]
    password: Option<String>,

    /// Workspace passcode
    #[arg(long)]
    passcode: Option<String>,

    /// JSON file with timing and cue classification settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fire GO once connected
    #[arg(long)]
    go: bool,

    /// How long to stay connected, in seconds
    #[arg(long, default_value_t = 30)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => SessionSettings::load_from_file(path).await?,
        None => SessionSettings::default(),
    };

    let session = start_session(settings).await;
    let mut events = session.subscribe();

    session
        .connect(ConnectionSettings {
            host: args.host.clone(),
            port: args.port,
            transport: if args.tcp { TransportKind::Tcp } else { TransportKind::Udp },
            password: args.password.clone(),
            passcode: args.passcode.clone(),
        })
        .await;

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut fired = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { continue };
                match event {
                    UiEvent::StateChanged { state, error } => {
                        log::info!("State: {:?} {}", state, error.unwrap_or_default());
                        if state == SessionState::Connected && args.go && !fired {
                            fired = true;
                            session.go().await;
                        }
                        if state.is_error() {
                            break;
                        }
                    }
                    UiEvent::CuesUpdated { list_id } => {
                        let cues = session.cue_cache.cues(&list_id).await.unwrap_or_default();
                        log::info!("List {} has {} cues", list_id, cues.len());
                        for cue in cues {
                            log::debug!(
                                "{}{} {} [{}]",
                                "  ".repeat(cue.depth),
                                cue.number,
                                cue.name,
                                cue.cue_type
                            );
                        }
                    }
                    other => log::info!("{:?}", other),
                }
            }
            _ = &mut deadline => break,
        }
    }

    session.disconnect().await;
    Ok(())
}
