use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use tracing::info;
use wikid_server::{open_store, ServerConfig, StoreConfig, WikiServer};
use wikid_store::TiddlerStore as _;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Serve(args) => cmd_serve(config, args),
        Command::Config => cmd_config(&config),
        Command::Stats => cmd_stats(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ServerConfig::default()),
    }
}

fn apply_overrides(config: &mut ServerConfig, args: ServeArgs) {
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(index) = args.index {
        config.index_path = index;
    }
    if let Some(files) = args.files {
        config.files_dir = files;
    }
}

fn cmd_serve(mut config: ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
    apply_overrides(&mut config, args);
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async move {
        let addr = config.bind_addr;
        let server = WikiServer::new(config)?;
        println!("{} wikid on {}", "✓".green().bold(), format!("http://{addr}").bold());
        server
            .serve(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                }
            })
            .await?;
        println!("{} Stopped.", "✓".green());
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_config(config: &ServerConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_stats(config: &ServerConfig) -> anyhow::Result<()> {
    let store = open_store(&config.store, config.list.clone())?;
    let backend = match &config.store {
        StoreConfig::Memory { snapshot_path: Some(path) } => format!("memory ({})", path.display()),
        StoreConfig::Memory { snapshot_path: None } => "memory".to_string(),
        StoreConfig::Sled { path } => format!("sled ({})", path.display()),
    };
    println!("Store: {}", backend.cyan());
    println!("Tiddlers: {}", store.len()?.to_string().bold());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn overrides_replace_config_values() {
        let mut config = ServerConfig::default();
        apply_overrides(
            &mut config,
            ServeArgs {
                bind: Some("0.0.0.0:9999".parse().unwrap()),
                index: None,
                files: Some(PathBuf::from("/tmp/files")),
            },
        );
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.index_path, PathBuf::from("index.html"));
        assert_eq!(config.files_dir, PathBuf::from("/tmp/files"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/no/such/wikid.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
