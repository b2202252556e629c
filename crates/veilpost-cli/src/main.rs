//! Veilpost command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Throwaway identity
//! veilpost keygen
//!
//! # Identity sealed under a passphrase in a local store
//! VEILPOST_PASSPHRASE=... veilpost keygen --store identity.redb
//!
//! # Gift-wrap a message and open it again
//! veilpost wrap --secret <hex> --to <pubkey> "hello" > wrap.json
//! veilpost unwrap --secret <hex> "$(cat wrap.json)"
//!
//! # Inspect a remote signer descriptor
//! veilpost parse-bunker "bunker://<pubkey>?relay=wss://relay.example"
//! ```

mod commands;
mod error;

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use veilpost_core::SystemEnv;
use veilpost_crypto::KdfAlgorithm;
use zeroize::Zeroizing;

use crate::error::CliError;

/// Veilpost protocol tool
#[derive(Parser, Debug)]
#[command(name = "veilpost")]
#[command(about = "Keys, gift wraps and signer descriptors for Veilpost")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an identity key
    Keygen {
        /// Seal the identity into this store instead of printing the secret
        #[arg(long)]
        store: Option<PathBuf>,

        /// Passphrase the sealed identity is derived from
        #[arg(long, env = "VEILPOST_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,

        /// Key derivation for the sealed identity
        #[arg(long, value_enum, default_value_t = Kdf::Argon2id)]
        kdf: Kdf,
    },

    /// Open the identity sealed in a store and print its public key
    Identity {
        /// Store written by `keygen --store`
        #[arg(long)]
        store: PathBuf,

        /// Passphrase the identity was sealed with
        #[arg(long, env = "VEILPOST_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Gift-wrap a direct message
    Wrap {
        /// Sender secret key (hex)
        #[arg(long, env = "VEILPOST_SECRET", hide_env_values = true)]
        secret: String,

        /// Recipient public key (hex)
        #[arg(long)]
        to: String,

        /// Message text
        text: String,
    },

    /// Open a gift wrap addressed to us
    Unwrap {
        /// Recipient secret key (hex)
        #[arg(long, env = "VEILPOST_SECRET", hide_env_values = true)]
        secret: String,

        /// Gift wrap event JSON
        event: String,
    },

    /// Parse a bunker:// connection string
    ParseBunker {
        /// Connection string
        uri: String,
    },

    /// Traffic bucket a text of the given byte length is padded to
    PadSize {
        /// Text length in bytes
        length: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kdf {
    Argon2id,
    Pbkdf2Sha256,
}

impl From<Kdf> for KdfAlgorithm {
    fn from(kdf: Kdf) -> Self {
        match kdf {
            Kdf::Argon2id => Self::Argon2id,
            Kdf::Pbkdf2Sha256 => Self::Pbkdf2Sha256,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    match run(args.command).await {
        Ok(output) => {
            if writeln!(io::stdout().lock(), "{output}").is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(command: Command) -> Result<String, CliError> {
    let env = SystemEnv::new();
    match command {
        Command::Keygen { store: None, .. } => commands::keygen(&env),
        Command::Keygen { store: Some(path), passphrase, kdf } => {
            let passphrase = passphrase.map(Zeroizing::new).ok_or(CliError::MissingPassphrase)?;
            commands::keygen_sealed(&env, &path, &passphrase, kdf.into()).await
        },
        Command::Identity { store, passphrase } => {
            let passphrase = passphrase.map(Zeroizing::new).ok_or(CliError::MissingPassphrase)?;
            commands::identity(&store, &passphrase).await
        },
        Command::Wrap { secret, to, text } => {
            commands::wrap(&env, &Zeroizing::new(secret), &to, &text)
        },
        Command::Unwrap { secret, event } => commands::unwrap(&Zeroizing::new(secret), &event),
        Command::ParseBunker { uri } => commands::parse_bunker(&uri),
        Command::PadSize { length } => Ok(commands::pad_size(length)),
    }
}
