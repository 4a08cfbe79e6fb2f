use anyhow::Context as _;
use clap::Parser;
use mitm_relay::{config::Config, plugins, server::MitmRelayServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mitm-relay")]
#[command(about = "A programmable forward proxy with TLS interception and plugin hooks")]
struct Cli {
    #[arg(short, long)]
    listen_host: Option<String>,

    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    #[arg(short, long)]
    config: Option<String>,

    /// CA certificate used to sign intercepted hosts
    #[arg(long)]
    ca_cert_file: Option<String>,

    #[arg(long)]
    ca_key_file: Option<String>,

    /// Key for generated leaf certificates, created in the cert dir if absent
    #[arg(long)]
    ca_signing_key_file: Option<String>,

    #[arg(long)]
    ca_cert_dir: Option<String>,

    /// Comma separated bundled plugin names
    #[arg(long, value_delimiter = ',')]
    plugins: Vec<String>,

    /// Require proxy authentication, as user:pass
    #[arg(long)]
    basic_auth: Option<String>,

    #[arg(long)]
    enable_events: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.listen_host {
            config.proxy_host = host;
        }
        if let Some(port) = self.listen_port {
            config.proxy_port = port;
        }
        if self.ca_cert_file.is_some() {
            config.ca_cert_file = self.ca_cert_file;
        }
        if self.ca_key_file.is_some() {
            config.ca_key_file = self.ca_key_file;
        }
        if self.ca_signing_key_file.is_some() {
            config.ca_signing_key_file = self.ca_signing_key_file;
        }
        if self.ca_cert_dir.is_some() {
            config.ca_cert_dir = self.ca_cert_dir;
        }
        if !self.plugins.is_empty() {
            config.plugins = self.plugins;
        }
        if self.basic_auth.is_some() {
            config.basic_auth = self.basic_auth;
        }
        config.enable_events |= self.enable_events;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    info!(
        "Plugins: {:?} (available: {})",
        config.plugins,
        plugins::bundled_names().collect::<Vec<_>>().join(", ")
    );

    let server = MitmRelayServer::new(config)
        .await
        .context("starting proxy server")?;
    server.run().await?;
    Ok(())
}
