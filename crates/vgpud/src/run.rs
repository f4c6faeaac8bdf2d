use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vgpuconfig::ServerConfig;
use vgpuserver::ConnectionOptions;
use vrend::Renderer;

use crate::backend;
use crate::cli::Overrides;
use crate::listener::Listener;
use crate::paths::AppPaths;

/// `RUST_LOG` wins over the configured filter.
pub fn initialise_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration (explicit file, else the per-user default) and
/// layers the command-line overrides on top.
pub fn resolve(overrides: &Overrides) -> Result<ServerConfig> {
    let paths = AppPaths::discover()?;
    let mut config = match &overrides.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            let path = paths.config_file();
            ServerConfig::load_or_default(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?
        }
    };
    apply_overrides(&mut config, overrides);
    if config.socket_path.is_none() {
        config.socket_path = Some(paths.socket_path());
    }
    config.validate().context("invalid settings")?;
    Ok(config)
}

fn apply_overrides(config: &mut ServerConfig, overrides: &Overrides) {
    if let Some(socket) = &overrides.socket {
        config.socket_path = Some(socket.clone());
    }
    if let Some(backend) = overrides.backend {
        config.backend = backend;
    }
    if let Some(max) = overrides.max_connections {
        config.max_connections = max;
    }
}

pub fn serve(config: &ServerConfig) -> Result<()> {
    let socket = config
        .socket_path
        .as_deref()
        .context("no socket path configured")?;
    let factory = backend::open(config)?;
    let listener = Listener::bind(socket)?;
    tracing::info!(
        backend = %config.backend,
        max_connections = config.max_connections,
        "vgpud ready"
    );
    listener.serve(
        factory,
        ConnectionOptions::from_config(config),
        config.max_connections,
    )
}

pub fn print_caps(config: &ServerConfig, json: bool) -> Result<()> {
    let factory = backend::open(config)?;
    let backend = factory.create().context("failed to create backend")?;
    let renderer = Renderer::new(backend, ConnectionOptions::from_config(config).renderer)
        .context("failed to initialise renderer")?;
    let caps = renderer.caps();

    if json {
        let text = serde_json::to_string_pretty(&caps).context("failed to encode caps")?;
        println!("{text}");
        return Ok(());
    }

    let v1 = &caps.v1;
    println!("backend            {}", renderer.backend_name());
    println!("caps version       {}", v1.max_version);
    println!("glsl level         {}", v1.glsl_level);
    println!(
        "texture sizes      2d {} / 3d {} / cube {}",
        caps.max_texture_2d_size, caps.max_texture_3d_size, caps.max_texture_cube_size
    );
    println!("array layers       {}", v1.max_texture_array_layers);
    println!("render targets     {}", v1.max_render_targets);
    println!("samples            {}", v1.max_samples);
    println!("vertex attribs     {}", caps.max_vertex_attribs);
    println!("capability bits    {:#010x}", caps.capability_bits);
    Ok(())
}

pub fn check_config(file: &Path, overrides: &Overrides) -> Result<()> {
    let mut config = ServerConfig::load(file)
        .with_context(|| format!("failed to load config {}", file.display()))?;
    apply_overrides(&mut config, overrides);
    config.validate().context("invalid settings")?;
    let text = config.to_toml_string().context("failed to print config")?;
    println!("# {} is valid", file.display());
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vgpuconfig::BackendKind;

    #[test]
    fn overrides_replace_file_values() {
        let mut config = ServerConfig::default();
        let overrides = Overrides {
            config: None,
            socket: Some(PathBuf::from("/tmp/override.sock")),
            backend: Some(BackendKind::Null),
            max_connections: Some(3),
        };
        apply_overrides(&mut config, &overrides);
        assert_eq!(
            config.socket_path.as_deref(),
            Some(Path::new("/tmp/override.sock"))
        );
        assert_eq!(config.backend, BackendKind::Null);
        assert_eq!(config.max_connections, 3);
    }

    #[test]
    fn absent_overrides_keep_file_values() {
        let mut config = ServerConfig {
            max_connections: 5,
            ..ServerConfig::default()
        };
        apply_overrides(&mut config, &Overrides::default());
        assert_eq!(config, ServerConfig {
            max_connections: 5,
            ..ServerConfig::default()
        });
    }
}
