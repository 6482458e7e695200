use epochbft::chain::RedbChain;
use epochbft::config::Config;
use epochbft::engine::Engine;
use epochbft::network::Network;
use epochbft::types::{Message, Validator};
use epochbft::validator::{StaticValidatorManager, ValidatorSet};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let id_arg = args
        .get(1)
        .expect("Usage: cargo run -- <node_id>")
        .parse::<u64>()?;
    let validator_id = format!("v{id_arg}");

    let config = Config::from_env();

    // Five-validator static committee, equal weight, fixed five-node devnet.
    let committee = ValidatorSet::new(
        (0..5)
            .map(|i| Validator::new(format!("v{i}"), 1).expect("weight is positive"))
            .collect(),
    );
    let validators = Arc::new(StaticValidatorManager::new(committee));

    let db_path = format!("./db/node_{id_arg}.redb");
    let chain = Arc::new(RedbChain::new(db_path, "epochbft-devnet")?);

    let port = if id_arg == 0 { 9000 } else { 0 };
    let network = Arc::new(Network::new(port).await?);
    if id_arg != 0 {
        log::info!("dialing bootnode");
        network.dial("/ip4/127.0.0.1/tcp/9000").await;
    }

    let engine = Arc::new(Engine::new(
        validator_id.clone(),
        Arc::clone(&chain),
        Arc::clone(&validators),
        Arc::clone(&network),
        config,
    ));
    engine.start();
    log::info!("node {validator_id} started, chain id {}", chain.chain_id());

    let mut finalized = engine.finalized_blocks().expect("started exactly once");
    let mut inbound = network
        .take_message_receiver()
        .expect("started exactly once");

    loop {
        tokio::select! {
            Some(msg) = inbound.recv() => {
                log_inbound(&msg);
                engine.add_message(msg).await;
            }
            Some(block) = finalized.recv() => {
                log::info!(
                    "finalized block {} at height {} (epoch {})",
                    block.hash(),
                    block.height(),
                    block.epoch(),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received");
                engine.stop();
                engine.wait().await;
                break;
            }
        }
    }

    log::info!("node {validator_id} shutdown complete");
    Ok(())
}

fn log_inbound(msg: &Message) {
    match msg {
        Message::Proposal(p) => log::debug!("received proposal from {}", p.proposer_id),
        Message::Vote(v) => log::debug!("received vote from {} (epoch {})", v.voter_id, v.epoch),
        Message::Block(b) => log::debug!("received block {}", b.hash),
        Message::CommitCertificate(cc) => log::debug!("received CC for block {}", cc.block_hash),
    }
}
