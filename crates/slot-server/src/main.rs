// slot-server/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use slot_server::{config::Config, run_server, ServingUpdate};

/// Local inference daemon: named model slots behind an OpenAI-compatible API.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "slot-server", version, about)]
struct Cli {
    /// Bind host (overrides API_HOST, the settings file and --lan)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides API_PORT and the settings file)
    #[arg(long)]
    port: Option<u16>,

    /// Maximum number of LOADING + READY slots
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_loaded_models: Option<u64>,

    /// Listen on all interfaces
    #[arg(long)]
    lan: bool,

    /// Path to the llama-server binary
    #[arg(long)]
    llama_bin: Option<std::path::PathBuf>,
}

#[cfg(feature = "cli")]
impl Cli {
    fn apply(self, cfg: &mut Config) {
        cfg.apply_update(&ServingUpdate {
            host: self.host,
            api_port: self.port,
            max_loaded_models: self.max_loaded_models.map(|max| max as usize),
            lan_access: self.lan.then_some(true),
        });
        if let Some(bin) = self.llama_bin {
            cfg.llama_bin = Some(bin);
        }
    }
}

#[cfg(feature = "cli")]
fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    cfg.apply_settings_file();
    cli.apply(&mut cfg);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cfg.blocking_threads.max(1))
        .build()?;
    runtime.block_on(run_server(cfg))
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
