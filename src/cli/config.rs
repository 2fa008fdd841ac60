//! CLI command for managing dut-provision configuration.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use dut_provision::config::{Config, DutConfig};

#[derive(Args)]
#[command(about = "Manage dut-provision configuration")]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Configuration file (defaults to the user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show the configuration file path
    Path,

    /// Create a configuration file for a device
    Init {
        /// Device name or host[:port]
        dut: String,

        /// SSH username
        #[arg(long, default_value = "root")]
        user: String,

        /// SSH port (default: 22)
        #[arg(long, default_value = "22")]
        port: u16,

        /// Path to SSH private key
        #[arg(long)]
        ssh_key: Option<String>,

        /// Base URL of the caching proxy
        #[arg(long)]
        cache_address: Option<String>,

        /// Where to write the file (defaults to the user config dir)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub fn execute(&self) -> Result<()> {
        match &self.action {
            ConfigAction::Show { config } => self.show_config(config.as_ref()),
            ConfigAction::Path => self.show_path(),
            ConfigAction::Init {
                dut,
                user,
                port,
                ssh_key,
                cache_address,
                path,
                force,
            } => {
                let mut device = DutConfig::new(dut.clone())
                    .with_user(user.clone())
                    .with_port(*port);
                if let Some(key) = ssh_key {
                    device = device.with_ssh_key(key.clone());
                }
                let mut config = Config::new(device);
                if let Some(address) = cache_address {
                    config = config.with_cache_address(address.clone());
                }
                self.init_config(&config, path.clone(), *force)
            }
        }
    }

    fn show_config(&self, path: Option<&PathBuf>) -> Result<()> {
        let config = match path {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        let yaml = serde_yaml::to_string(&config)?;
        println!("{}", yaml);
        Ok(())
    }

    fn show_path(&self) -> Result<()> {
        match Config::default_path() {
            Some(path) => {
                println!("Configuration file path: {}", path.display());
                if path.exists() {
                    println!("Status: File exists");
                } else {
                    println!("Status: File does not exist");
                }
            }
            None => {
                println!("Could not determine configuration directory");
            }
        }
        Ok(())
    }

    fn init_config(&self, config: &Config, path: Option<PathBuf>, force: bool) -> Result<()> {
        let path = match path.or_else(Config::default_path) {
            Some(path) => path,
            None => return Err(anyhow!("Could not determine configuration directory, pass --path")),
        };

        if path.exists() && !force {
            return Err(anyhow!(
                "Configuration file already exists at {}\nUse --force to overwrite",
                path.display()
            ));
        }

        config.save_to(&path)?;
        println!("✓ Configuration written to {}", path.display());
        Ok(())
    }
}
