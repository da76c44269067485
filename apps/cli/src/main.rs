//! Command-line client for chunkferry.

mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkferry")]
#[command(about = "Resumable chunked uploads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ServerArgs {
    /// Server WebSocket URL
    #[arg(long, env = "CHUNKFERRY_SERVER", default_value = "ws://localhost:3000")]
    server: String,

    /// Chunk size in bytes
    #[arg(long, default_value_t = chunkferry_protocol::DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, resuming any earlier partial upload of the same content
    Upload {
        /// File to upload
        file: PathBuf,

        /// Name to store the file under (defaults to the file's own name)
        #[arg(long)]
        name: Option<String>,

        /// Chunks in flight at once
        #[arg(long, default_value_t = chunkferry_client::types::DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Retries per chunk before giving up
        #[arg(long, default_value_t = chunkferry_client::types::DEFAULT_MAX_RETRIES)]
        retries: u32,

        #[command(flatten)]
        server: ServerArgs,
    },
    /// Show whether the server already holds a file and how much of it
    Status {
        /// File to check
        file: PathBuf,

        #[command(flatten)]
        server: ServerArgs,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Upload {
            file,
            name,
            concurrency,
            retries,
            server,
        } => {
            let config = chunkferry_client::UploaderConfig {
                chunk_size: server.chunk_size,
                concurrency,
                max_retries: retries,
                ..Default::default()
            };
            rt.block_on(commands::upload(&server.server, &file, name, config))
        }
        Commands::Status { file, server } => {
            rt.block_on(commands::status(&server.server, &file, server.chunk_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_defaults() {
        let cli = Cli::try_parse_from(["chunkferry", "upload", "a.bin"]).unwrap();
        match cli.command {
            Commands::Upload {
                file,
                name,
                concurrency,
                retries,
                server,
            } => {
                assert_eq!(file, PathBuf::from("a.bin"));
                assert!(name.is_none());
                assert_eq!(concurrency, 4);
                assert_eq!(retries, 3);
                assert_eq!(server.chunk_size, 2 * 1024 * 1024);
            }
            Commands::Status { .. } => panic!("expected upload"),
        }
    }

    #[test]
    fn status_accepts_server_override() {
        let cli = Cli::try_parse_from([
            "chunkferry",
            "status",
            "a.bin",
            "--server",
            "ws://example.com:9000",
        ])
        .unwrap();
        match cli.command {
            Commands::Status { server, .. } => assert_eq!(server.server, "ws://example.com:9000"),
            Commands::Upload { .. } => panic!("expected status"),
        }
    }
}
