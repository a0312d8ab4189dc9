use cln_plugin::Builder;
use cln_virtualchannels::cln_adapters::hooks::{
    on_custommsg, on_htlc_accepted, on_virtualchannel_list, on_virtualchannel_open,
    on_virtualinvoice, on_virtualpay, State,
};
use cln_virtualchannels::cln_adapters::options::Options;
use cln_virtualchannels::cln_adapters::rpc::ClnApiRpc;
use cln_virtualchannels::core::service::{Providers, VirtualChannelService};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let options = Options::new();
    let builder = options
        .clone()
        .register_with_builder(Builder::new(tokio::io::stdin(), tokio::io::stdout()));

    if let Some(plugin) = builder
        .hook("htlc_accepted", on_htlc_accepted)
        .hook("custommsg", on_custommsg)
        .rpcmethod(
            "virtualchannel-open",
            "Trust a connected peer to spend through us",
            on_virtualchannel_open,
        )
        .rpcmethod(
            "virtualchannel-list",
            "List incoming and outgoing virtual channels",
            on_virtualchannel_list,
        )
        .rpcmethod(
            "virtualpay",
            "Pay an invoice, falling back to virtual channel partners",
            on_virtualpay,
        )
        .rpcmethod(
            "virtualinvoice",
            "Create an invoice that virtual channel partners can settle",
            on_virtualinvoice,
        )
        .configure()
        .await?
    {
        let config = match options.extract_config(&plugin) {
            Ok(config) => config,
            Err(e) => return plugin.disable(&e.to_string()).await,
        };

        let dir = plugin.configuration().lightning_dir;
        let rpc_path = Path::new(&dir).join(&plugin.configuration().rpc_file);
        let api = Arc::new(ClnApiRpc::new(rpc_path));
        let providers = Providers {
            payer: api.clone(),
            messenger: api.clone(),
            peers: api.clone(),
            invoices: api,
        };
        let service = Arc::new(VirtualChannelService::new(providers, config.policy()));

        let plugin = plugin.start(State::new(service.clone())).await?;
        info!("virtualchannels started with {:?}", config.policy());

        let trusted_peers = config.trusted_peers().to_vec();
        tokio::spawn(async move {
            for peer in trusted_peers {
                if let Err(e) = service.open_incoming_trust(peer).await {
                    warn!("Could not open virtual channel with {}: {}", peer, e);
                }
            }
        });

        plugin.join().await
    } else {
        Ok(())
    }
}
