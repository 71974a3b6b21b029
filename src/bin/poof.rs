use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use poof::config::{self, Config, FileConfig, Mode, KNOWN_SHELLS};
use poof::supervisor;

#[derive(Parser)]
#[command(
    name = "poof",
    version,
    about = "run commands against a throwaway copy-on-write view of the filesystem"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v, -vv)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command whose writes vanish when it exits
    Exec {
        /// Kill the command after N seconds (exit code 124)
        #[arg(long)]
        timeout: Option<String>,

        /// memory.max for the sandbox, e.g. 512M
        #[arg(long)]
        memory: Option<String>,

        /// pids.max for the sandbox
        #[arg(long)]
        pids: Option<String>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a command and persist its writes to an upper directory
    Run {
        /// Directory receiving the writes (default: <cwd>/<command name>)
        #[arg(long)]
        upper: Option<PathBuf>,

        #[arg(long)]
        timeout: Option<String>,

        #[arg(long)]
        memory: Option<String>,

        #[arg(long)]
        pids: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Open a shell (or run a command) and review its changes on exit
    Enter {
        #[arg(long)]
        timeout: Option<String>,

        #[arg(long)]
        memory: Option<String>,

        #[arg(long)]
        pids: Option<String>,

        /// Command to run instead of $SHELL
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

const COMMANDS: &[&str] = &["exec", "run", "enter"];

/// Insert the implied subcommand: `poof` alone means `enter`, `poof bash`
/// means `exec bash`, and any other bare program runs interactively.
fn with_default_command(mut argv: Vec<String>) -> Vec<String> {
    let first = argv
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, a)| *a != "--" && !a.starts_with('-'))
        .map(|(i, a)| (i, a.clone()));

    match first {
        Some((_, cmd)) if COMMANDS.contains(&cmd.as_str()) => argv,
        Some((i, cmd)) => {
            let name = Path::new(&cmd)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            let implied = if KNOWN_SHELLS.contains(&name) {
                "exec"
            } else {
                "enter"
            };
            let at = if i > 1 && argv[i - 1] == "--" { i - 1 } else { i };
            argv.insert(at, implied.to_string());
            argv
        }
        None => {
            argv.push("enter".to_string());
            argv
        }
    }
}

fn main() {
    let argv = with_default_command(std::env::args().collect());
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            // Option/usage errors exit 1 before anything is forked.
            eprint!("{}", e);
            std::process::exit(1);
        }
        Err(e) => {
            // --help / --version
            print!("{}", e);
            std::process::exit(0);
        }
    };

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("poof: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let file = FileConfig::load().context("failed to load poof.toml")?;
    let cwd = std::env::current_dir().context("failed to read current directory")?;

    let (mode, upper_dir, command, timeout, memory, pids) = match cli.command {
        Commands::Exec {
            timeout,
            memory,
            pids,
            command,
        } => (Mode::Ephemeral, None, command, timeout, memory, pids),
        Commands::Run {
            upper,
            timeout,
            memory,
            pids,
            command,
        } => {
            // A terminal user without an explicit upper gets the review
            // flow; scripts and redirects get a plain persistent dir.
            use std::io::IsTerminal;
            let stdin_tty = std::io::stdin().is_terminal();
            let mode = if stdin_tty && upper.is_none() {
                Mode::Interactive
            } else {
                Mode::Persistent
            };
            (mode, upper, command, timeout, memory, pids)
        }
        Commands::Enter {
            timeout,
            memory,
            pids,
            command,
        } => {
            let command = if command.is_empty() {
                vec![config::resolve_shell()]
            } else {
                command
            };
            (Mode::Interactive, None, command, timeout, memory, pids)
        }
    };

    let memory_limit = match memory.as_deref().or(file.limits.memory.as_deref()) {
        Some(s) => Some(config::parse_size(s)?),
        None => None,
    };
    let pids_limit = match pids {
        Some(s) => Some(config::parse_count("--pids", &s)?),
        None => file.limits.pids,
    };
    let timeout = match timeout {
        Some(s) => Some(config::parse_count("--timeout", &s)?),
        None => file.limits.timeout,
    };

    let config = Config {
        interactive_target: (mode == Mode::Interactive).then(|| cwd.clone()),
        mode,
        command,
        upper_dir,
        memory_limit,
        pids_limit,
        timeout,
        cwd,
        fuse_overlayfs: file.tools.fuse_overlayfs,
        diff_tool: file.tools.diff,
    };

    Ok(supervisor::run(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_explicit_command_untouched() {
        assert_eq!(
            with_default_command(argv(&["poof", "exec", "ls"])),
            argv(&["poof", "exec", "ls"])
        );
        assert_eq!(
            with_default_command(argv(&["poof", "run", "--upper=/u", "make"])),
            argv(&["poof", "run", "--upper=/u", "make"])
        );
    }

    #[test]
    fn test_bare_invocation_enters() {
        assert_eq!(with_default_command(argv(&["poof"])), argv(&["poof", "enter"]));
        assert_eq!(
            with_default_command(argv(&["poof", "-v"])),
            argv(&["poof", "-v", "enter"])
        );
    }

    #[test]
    fn test_shell_name_defaults_to_exec() {
        assert_eq!(
            with_default_command(argv(&["poof", "bash"])),
            argv(&["poof", "exec", "bash"])
        );
        assert_eq!(
            with_default_command(argv(&["poof", "/bin/zsh"])),
            argv(&["poof", "exec", "/bin/zsh"])
        );
    }

    #[test]
    fn test_other_program_defaults_to_enter() {
        assert_eq!(
            with_default_command(argv(&["poof", "make", "install"])),
            argv(&["poof", "enter", "make", "install"])
        );
    }

    #[test]
    fn test_double_dash_keeps_program_after_marker() {
        assert_eq!(
            with_default_command(argv(&["poof", "--", "bash"])),
            argv(&["poof", "exec", "--", "bash"])
        );
    }
}
