use clap::{Parser, Subcommand};
use convey::auth::ClientKey;
use convey::client::Uploader;
use convey::config::{Config, DEFAULT_PORT};
use convey::error::UploadError;
use convey::server::Server;
use convey::validate::RequiredFields;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "convey")]
#[command(about = "Send files and metadata to a remote server")]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "convey.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Server host name or address
    #[arg(value_name = "SERVER")]
    server: Option<String>,

    /// File to upload; '-' reads standard input (requires -n)
    #[arg(value_name = "FILE", default_value = "-")]
    file: String,

    /// Path to a JSON file containing metadata
    #[arg(short = 'm', long = "meta")]
    meta: Option<PathBuf>,

    /// Colon separated key:value pair; overrides or adds metadata fields
    #[arg(short = 'k', long = "key-value")]
    key_value: Vec<String>,

    /// Override the destination file name
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the upload server
    Server,
    /// Generate a client key, optionally authorizing it on this machine
    Keygen {
        /// Key id presented during the handshake
        key_id: String,
        /// Where to write the client key file
        #[arg(long, default_value = "client.key")]
        out: PathBuf,
        /// Also drop the matching server-side key into this directory
        #[arg(long)]
        authorize: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), UploadError> {
    if let Some(command) = cli.command {
        return match command {
            Commands::Server => run_server(&cli.config).await,
            Commands::Keygen {
                key_id,
                out,
                authorize,
            } => run_keygen(&key_id, &out, authorize.as_deref()),
        };
    }

    let Some(server) = cli.server else {
        return Err(UploadError::Config(
            "server host required; usage: convey <server> <file>".into(),
        ));
    };

    let config = Config::load_or_create(&cli.config)?;
    let meta = build_metadata(cli.meta.as_deref(), &cli.key_value)?;

    let (reader, source_len, default_name): (Box<dyn Read + Send>, Option<u64>, Option<String>) =
        if cli.file == "-" {
            (Box::new(std::io::stdin()), None, None)
        } else {
            let path = PathBuf::from(&cli.file);
            let file = File::open(&path)?;
            let len = file.metadata()?.len();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string());
            (Box::new(file), Some(len), name)
        };

    let Some(filename) = cli.name.or(default_name) else {
        return Err(UploadError::Config(
            "destination name not known; set it explicitly with --name".into(),
        ));
    };

    let key = ClientKey::load(&config.client.key_file).map_err(|e| {
        UploadError::Config(format!(
            "cannot load client key {}: {e}",
            config.client.key_file.display()
        ))
    })?;

    let show_progress = config.client.progress_bar && std::io::stderr().is_terminal();
    let mut client_config = config.client;
    client_config.progress_bar = show_progress;

    let addr = format!("{server}:{}", cli.port);
    let uploader = Uploader::connect(
        addr,
        key,
        filename,
        meta,
        reader,
        source_len,
        client_config,
    )
    .await?;
    let upload_id = uploader.run().await?;
    info!(upload_id = %upload_id, "upload complete");
    println!("{upload_id}");
    Ok(())
}

async fn run_server(config_path: &PathBuf) -> Result<(), UploadError> {
    let config = Config::load_or_create(config_path)?;
    println!("Convey upload server");
    println!("Listening on: {}:{}", config.server.address, config.server.port);
    println!("Destination: {}", config.server.destination_dir.display());
    let validator = RequiredFields::new(config.server.required_meta.clone());
    Server::new(config.server, validator).run().await
}

fn run_keygen(
    key_id: &str,
    out: &PathBuf,
    authorize: Option<&std::path::Path>,
) -> Result<(), UploadError> {
    let key = ClientKey::generate(key_id)?;
    key.save(out)?;
    println!("Wrote client key: {}", out.display());
    if let Some(dir) = authorize {
        std::fs::create_dir_all(dir)?;
        let server_side = dir.join(format!("{key_id}.key"));
        std::fs::write(&server_side, format!("{}\n", hex::encode(key.secret)))?;
        println!("Authorized key in: {}", server_side.display());
    } else {
        println!("Copy the secret into the server's authorized keys directory as {key_id}.key");
    }
    Ok(())
}

/// Builds the metadata JSON: an optional file merged with `-k` overrides.
fn build_metadata(meta_path: Option<&std::path::Path>, key_values: &[String]) -> Result<String, UploadError> {
    let mut object = match meta_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => {
                    return Err(UploadError::Config(
                        "invalid json metadata: must contain an object".into(),
                    ));
                }
            }
        }
        None => Map::new(),
    };

    for pair in key_values {
        let Some((key, value)) = pair.split_once(':') else {
            return Err(UploadError::Config(format!(
                "invalid key-value pair '{pair}': must be separated by ':'"
            )));
        };
        object.insert(key.to_string(), Value::String(value.to_string()));
    }

    Ok(serde_json::to_string(&Value::Object(object))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_metadata_empty() {
        let meta = build_metadata(None, &[]).unwrap();
        assert_eq!(meta, "{}");
    }

    #[test]
    fn test_build_metadata_key_values() {
        let pairs = vec!["project:alpha".to_string(), "note:a:b".to_string()];
        let meta = build_metadata(None, &pairs).unwrap();
        let parsed: Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(parsed["project"], "alpha");
        // Only the first colon separates; the rest is the value.
        assert_eq!(parsed["note"], "a:b");
    }

    #[test]
    fn test_build_metadata_invalid_pair() {
        let pairs = vec!["nocolon".to_string()];
        assert!(build_metadata(None, &pairs).is_err());
    }

    #[test]
    fn test_build_metadata_file_and_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, r#"{"project":"alpha","sample":"S1"}"#).unwrap();

        let pairs = vec!["sample:S2".to_string()];
        let meta = build_metadata(Some(&path), &pairs).unwrap();
        let parsed: Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(parsed["project"], "alpha");
        assert_eq!(parsed["sample"], "S2");
    }

    #[test]
    fn test_build_metadata_rejects_non_object() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, "[1,2,3]").unwrap();
        assert!(build_metadata(Some(&path), &[]).is_err());
    }
}
