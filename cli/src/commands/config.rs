use color_eyre::eyre::Result;

use crate::config::{config_path, UserConfig};
use crate::logging::log_dir;

pub fn run(path: bool) -> Result<()> {
    if path {
        println!("{}", config_path().display());
        return Ok(());
    }

    let config = UserConfig::load();
    let versions: Vec<String> = config
        .supported_versions()
        .iter()
        .map(|v| v.to_string())
        .collect();

    println!("# {}", config_path().display());
    println!("# logs: {}", log_dir().display());
    println!("# socket: {}", config.socket_path().display());
    println!("# versions offered: {}", versions.join(", "));
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
