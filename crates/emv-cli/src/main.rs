use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod formatters;
mod transport;

use formatters::FormatMode;
use transport::ReaderKind;

#[derive(Parser)]
#[command(name = "emv-scan")]
#[command(about = "EMV card reader, security analyzer and terminal fuzzer")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand
#[derive(Args)]
pub struct GlobalArgs {
    /// Reader configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-exchange timeout, overrides the configuration file
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Reader backend
    #[arg(long, value_enum, default_value_t = ReaderKind::Pcsc, global = true)]
    pub reader: ReaderKind,

    /// Serial device for pn532, reader name for pcsc
    #[arg(long, global = true)]
    pub port: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the read sequence and print card data and the security report
    Read {
        /// Print the card data as JSON instead
        #[arg(long)]
        json: bool,

        #[arg(short, long, value_enum, default_value_t = FormatMode::Human)]
        format: FormatMode,
    },
    /// Run the read sequence and dump every TLV in every response
    Dump,
    /// Fuzz a terminal with a preset and export the session
    Fuzz {
        /// Preset name; see --list
        #[arg(long, default_value = "select-bitflip")]
        preset: String,

        /// Directory for the JSON export
        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Mutator seed, overrides the preset's
        #[arg(long)]
        seed: Option<u64>,

        /// Terminal label used in the export
        #[arg(long, default_value = "terminal")]
        terminal: String,

        /// Re-send each anomaly's command this many times after the run
        #[arg(long)]
        reproduce: Option<u32>,

        /// List built-in presets and exit
        #[arg(long)]
        list: bool,
    },
    /// Interpret a status word, e.g. 6A82
    Status { sw: String },
}

fn main() -> anyhow::Result<()> {
    // RUST_LOG=debug shows every exchange
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Read { json, format } => commands::read::cmd_read(&cli.global, json, format),
        Command::Dump => commands::dump::cmd_dump(&cli.global),
        Command::Fuzz {
            preset,
            out,
            seed,
            terminal,
            reproduce,
            list,
        } => {
            if list {
                commands::fuzz::list_presets();
                return Ok(());
            }
            let options = commands::fuzz::FuzzOptions {
                preset,
                out,
                seed,
                terminal,
                reproduce,
            };
            commands::fuzz::cmd_fuzz(&cli.global, &options)
        }
        Command::Status { sw } => commands::status::cmd_status(&sw),
    }
}
