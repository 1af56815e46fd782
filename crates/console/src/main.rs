// Console vocale du support
//
// Ouvre un appel en direct avec l'agent vocal pendant la consultation du
// dossier d'un client :
// - Entrée : décroche / raccroche
// - q : quitte
// - Ctrl+C : raccroche et quitte

use std::io::{self, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use audio::{devices, AudioConfig};
use console::{
    format_elapsed, CallController, CallDevices, CallHandle, CallState, CallStatus, ConsoleConfig, DEFAULT_AGENT_ID,
    DEFAULT_INSTRUCTION,
};
use network::{NetworkConfig, DEFAULT_ENDPOINT};

#[derive(Parser)]
#[command(author, version, about = "Console vocale : appel en direct avec l'agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lance un appel interactif pour le dossier d'un client
    Call {
        /// Nom du client dont le dossier est ouvert
        #[arg(short, long)]
        client_name: String,

        /// Clé d'API du service d'agent
        #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Identifiant de l'agent distant
        #[arg(long, default_value = DEFAULT_AGENT_ID)]
        agent: String,

        /// URL websocket du service
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Blocs de capture plus courts (128 ms)
        #[arg(long)]
        low_latency: bool,
    },
    /// Affiche les périphériques audio par défaut
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Call {
            client_name,
            api_key,
            agent,
            endpoint,
            low_latency,
        } => {
            let config = ConsoleConfig {
                audio: if low_latency { AudioConfig::low_latency() } else { AudioConfig::default() },
                network: NetworkConfig {
                    endpoint,
                    api_key,
                    ..NetworkConfig::default()
                },
                agent_id: agent,
                instruction_template: DEFAULT_INSTRUCTION.to_string(),
            };
            run_call(config, client_name).await?
        }
        Commands::Devices => show_devices(),
    }

    Ok(())
}

/// Boucle interactive d'un appel
async fn run_call(config: ConsoleConfig, client_name: String) -> Result<()> {
    config.validate()?;

    println!("🎧 Console vocale - dossier de {}", client_name);
    println!("   Agent : {}", config.agent_id);
    println!(
        "   Audio : {} → {}, blocs de {:.0} ms",
        config.audio.input_mime_type(),
        config.audio.output_mime_type(),
        config.audio.block_duration_ms()
    );
    println!("\n📋 Entrée : décrocher / raccrocher   q : quitter   Ctrl+C : arrêt");

    let devices = CallDevices::system(&config)?;
    let handle = CallController::spawn(config, devices, client_name);

    let mut status = handle.subscribe();
    let mut last_state = status.borrow().state;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\n🛑 Arrêt demandé");
                break;
            }

            line = lines.next_line() => {
                match line? {
                    Some(input) if input.trim().eq_ignore_ascii_case("q") => break,
                    Some(_) => spawn_toggle(&handle),
                    None => break, // stdin fermé
                }
            }

            changed = status.changed() => {
                if changed.is_err() {
                    break; // contrôleur arrêté
                }
                let current = status.borrow_and_update().clone();
                render(&current, last_state);
                last_state = current.state;
            }
        }
    }

    handle.shutdown().await?;
    println!("👋 Au revoir !");
    Ok(())
}

/// Le toggle attend l'ouverture de la session : il tourne à part pour que
/// la boucle reste réactive (un second Entrée annule la connexion).
fn spawn_toggle(handle: &CallHandle) {
    let handle = handle.clone();
    tokio::spawn(async move {
        match handle.toggle_call().await {
            Ok(state) => debug!(%state, "toggle terminé"),
            Err(e) => eprintln!("\n❌ {}", e),
        }
    });
}

fn render(status: &CallStatus, previous: CallState) {
    if status.state != previous {
        match status.state {
            CallState::Connecting => println!("\n📡 Connexion à l'agent..."),
            CallState::Open => println!("\n✅ En ligne"),
            CallState::Closing => println!("\n📴 Raccrochage..."),
            CallState::Idle => println!("\n⏸️  Appel terminé"),
            CallState::Error => match &status.last_error {
                Some(e) => println!("\n❌ Appel interrompu : {}", e),
                None => println!("\n❌ Appel interrompu"),
            },
        }
    }

    if status.state == CallState::Open {
        let activity = if status.playing { "🔊" } else { "  " };
        print!("\r⏱️  {} {}", format_elapsed(status.elapsed_seconds), activity);
        let _ = io::stdout().flush();
    }
}

fn show_devices() {
    println!("🎛️  Périphériques audio par défaut");

    match devices::default_input() {
        Some(device) => println!("   🎤 Entrée : {}", device),
        None => println!("   🎤 Entrée : aucun périphérique"),
    }

    match devices::default_output() {
        Some(device) => println!("   🔊 Sortie : {}", device),
        None => println!("   🔊 Sortie : aucun périphérique"),
    }
}
