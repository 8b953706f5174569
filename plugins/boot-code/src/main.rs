//! Boot Code Plugin - Main Entry Point
//!
//! Binds a loopback port, registers the boot code, health and reflection
//! services, prints the handshake line on stdout and serves until SIGINT or
//! SIGTERM. Logs go to stderr.
//!
//! Usage:
//!     boot-code-plugin
//!     boot-code-plugin --network unix --address /tmp/boot.sock

use boot_code_plugin::config::Args;
use boot_code_plugin::proto::{boot_code_plugin_server::BootCodePluginServer, FILE_DESCRIPTOR_SET};
use boot_code_plugin::BootCodeService;
use boot_plugin::plugin::PluginServer;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    boot_plugin::tracing::install_panic_hook();

    let args = Args::parse();

    boot_plugin::tracing::init_with_filter(&args.log_level().to_string().to_lowercase());

    info!("Initializing Boot Code Plugin");
    info!("  Version: {}", env!("CARGO_PKG_VERSION"));

    let service = BootCodeService::new(args.app_protocol_version)?;

    PluginServer::new("boot-code-plugin", env!("CARGO_PKG_VERSION"))
        .bind(args.bind_spec())
        .app_protocol_version(args.app_protocol_version)
        .drain_timeout(args.drain_timeout())
        .settle_delay(args.settle_delay())
        .serve(BootCodePluginServer::new(service), &[FILE_DESCRIPTOR_SET])
        .await?;

    Ok(())
}
