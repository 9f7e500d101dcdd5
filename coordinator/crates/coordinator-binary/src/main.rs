#![cfg_attr(test, allow(unused_crate_dependencies))]

use anyhow::anyhow;
use clap::crate_version;
use mimalloc::MiMalloc;
use reporting_server::ServerConfig;
use tokio::runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod args;

const THREAD_NAME: &str = "schema-reporting";

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("installing default crypto provider"))?;

    let args = args::parse();
    let config = args.config()?;

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name(THREAD_NAME)
        .build()?;

    runtime.block_on(async move {
        let filter = args.log_level.unwrap_or_default().filter();

        tracing_subscriber::registry()
            .with(args.log_format())
            .with(EnvFilter::new(&filter))
            .init();

        let crate_version = crate_version!();
        tracing::info!("Schema Reporting Coordinator {crate_version}");

        let config = ServerConfig {
            listen_addr: args.listen_address,
            config,
        };

        reporting_server::serve(config).await?;

        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
