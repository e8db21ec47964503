use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strand::channel::ChannelStateStore;
use strand::invoice::InvoiceStore;
use strand::store::Store;
use strand::tasks::{cancel_tasks_and_wait_for_completion, new_tokio_cancellation_token};
use strand::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::parse();
    info!(store_dir = ?config.store_dir, "starting strand node");

    let store = Store::new(&config.store_dir)
        .map_err(|err| anyhow::anyhow!("unable to open store: {}", err))?;

    let channels = store.fetch_all_channels()?;
    let waiting_close = store.fetch_waiting_close_channels()?;
    let pending_close = store.fetch_closed_channels(true)?;
    let pending_invoices = store.fetch_all_invoices(true)?;
    info!(
        open_channels = channels.len(),
        waiting_close = waiting_close.len(),
        pending_close = pending_close.len(),
        pending_invoices = pending_invoices.len(),
        "store loaded"
    );

    // The contract court attaches here once the chain backend client for
    // config.chain_rpc is connected; wallet, switch and peer transport are
    // provided by their own daemons.
    let token = new_tokio_cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
    cancel_tasks_and_wait_for_completion().await;

    Ok(())
}
