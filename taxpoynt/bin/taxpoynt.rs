#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(unix))]
compile_error!("Only unix targets are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = find_config_file()?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let taxpoynt: taxpoynt::TaxPoynt = ron::from_str(&config_content)?;

    taxpoynt.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `TAXPOYNT_CONFIG` environment variable
/// 2. ./taxpoynt.config.ron (current working directory)
/// 3. /etc/taxpoynt/taxpoynt.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<std::path::PathBuf> {
    if let Ok(env_path) = std::env::var("TAXPOYNT_CONFIG") {
        let path = std::path::PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "TAXPOYNT_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        std::path::PathBuf::from("./taxpoynt.config.ron"),
        std::path::PathBuf::from("/etc/taxpoynt/taxpoynt.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - TAXPOYNT_CONFIG environment variable\n{paths_tried}"
    )
}
