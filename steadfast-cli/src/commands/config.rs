//! Configuration CLI commands.
//!
//! Provides `config show`, `config init` and `config path`.

use std::path::Path;

use clap::Subcommand;
use console::style;
use steadfast::ConfigFile;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as INI
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand against `path`.
pub fn run(command: ConfigCommands, path: &Path, config: &ConfigFile) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            println!("; {}", path.display());
            print!("{}", config.to_ini_string()?);
            Ok(())
        }
        ConfigCommands::Init { force } => {
            init(path, force)?;
            println!("{} {}", style("Wrote").green().bold(), path.display());
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Write defaults to `path` unless it exists and `force` is unset.
fn init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        )));
    }
    ConfigFile::default().save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        init(&path, false).unwrap();
        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded, ConfigFile::default());
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[cache]\ncapacity = 5\n").unwrap();

        assert!(matches!(init(&path, false), Err(CliError::Config(_))));
        init(&path, true).unwrap();
        assert_eq!(
            ConfigFile::load(&path).unwrap().engine.cache.capacity,
            steadfast::cache::DEFAULT_CACHE_CAPACITY
        );
    }
}
