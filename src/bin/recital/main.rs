use std::io::Read;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use recital::chunker;
use recital::config::Config;
use recital::error::RecitalError;

#[derive(Parser)]
#[command(
    name = "recital",
    about = "Read text aloud",
    long_about = "Recital reads text aloud through a remote text-to-speech service. \
        Long text is split into sentence-aligned chunks that are synthesized one \
        at a time and played back to back, so speech starts as soon as the first \
        chunk is ready."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/recital/config.yaml. Built-in defaults are used
    /// when the default file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the recital crate, showing each
    /// synthesis request and when every segment is scheduled.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a file (or stdin) aloud
    ///
    /// Runs in the foreground until the text has been read or Ctrl+C is
    /// pressed.
    Speak {
        /// Text file to read (reads from stdin if omitted)
        file: Option<String>,

        /// Synthesize and schedule without playing any sound
        #[arg(long)]
        silent: bool,
    },

    /// Show how a file (or stdin) would be chunked
    ///
    /// Prints each chunk with its index and character count, using the
    /// configured chunk size.
    Chunks {
        /// Text file to split (reads from stdin if omitted)
        file: Option<String>,
    },

    /// List available audio output devices
    ///
    /// Use --set to write a device name to the config file.
    Devices {
        /// Write the chosen device name to the config file
        #[arg(long)]
        set: Option<String>,
    },

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, RecitalError> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_path)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("recital=debug,info")
    } else {
        EnvFilter::new("recital=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Install shell completions for `$SHELL` unless the completion file already
/// exists. Failures are ignored.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("recital"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_recital"))
    } else if shell_env.ends_with("/fish") {
        (Shell::Fish, home.join(".config/fish/completions/recital.fish"))
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "recital", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: &Cli) -> Result<(), RecitalError> {
    match &cli.command {
        Command::Speak { file, silent } => {
            let config = load_config(cli)?;
            let text = read_text(file.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(recital::speak::run_speak(config, &text, *silent))
        }
        Command::Chunks { file } => {
            let config = load_config(cli)?;
            let text = read_text(file.as_deref())?;
            for chunk in chunker::split(&text, config.playback.chunk_chars) {
                println!(
                    "[{}] {} chars: {:?}",
                    chunk.index,
                    chunk.text.chars().count(),
                    chunk.text
                );
            }
            Ok(())
        }
        Command::Devices { set } => run_devices(cli, set.as_deref()),
        Command::Completions { shell } => {
            generate(*shell, &mut Cli::command(), "recital", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn read_text(file: Option<&str>) -> Result<String, RecitalError> {
    match file {
        Some(path) => {
            let path = Config::expand_path(path);
            std::fs::read_to_string(&path).map_err(|e| {
                RecitalError::Other(format!("failed to read {}: {e}", path.display()))
            })
        }
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .map_err(|e| RecitalError::Other(format!("failed to read stdin: {e}")))?;
            Ok(text)
        }
    }
}

fn run_devices(cli: &Cli, set: Option<&str>) -> Result<(), RecitalError> {
    if let Some(device_name) = set {
        let path = config_path(cli);
        Config::set_audio_device(&path, device_name)?;
        println!("Set audio device to: {device_name}");
        return Ok(());
    }

    let devices = recital::audio::output::speaker::list_output_devices()?;
    if devices.is_empty() {
        println!("No audio output devices found.");
        return Ok(());
    }

    let default_name = recital::audio::output::speaker::default_output_device_name();
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }

    Ok(())
}
