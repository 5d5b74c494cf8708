// Card bring-up example
//
// Loads a card configuration, walks a mock card through initialize and
// configure, and prints the status report as JSON.

use amc13_manager::{CardConfig, LifecycleController, MockBoard, MockFactory, MockUpstream};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| concat!(env!("CARGO_MANIFEST_DIR"), "/demos/amc13.toml").to_string());

    println!("AMC13 Bring-up Example");
    println!("======================\n");

    println!("1. Loading configuration from {path}");
    let config = CardConfig::load(&path)?;
    println!("   card {} at {}", config.card_name, config.connection_locator());

    let board = MockBoard::new();
    let controller = LifecycleController::new(
        &config,
        Arc::new(MockFactory::new(board.clone())),
        Arc::new(MockUpstream::new()),
    )?;

    println!("\n2. Initializing...");
    controller.initialize()?;
    println!("   state: {}", controller.state());

    println!("\n3. Configuring...");
    controller.configure()?;
    println!("   state: {}", controller.state());

    println!("\n4. Register operations issued:");
    for (i, op) in board.operations().iter().enumerate() {
        println!("  {:2}. {:?}", i + 1, op);
    }

    println!("\n5. Status report:");
    println!("{}", controller.status()?.to_json()?);

    controller.reset()?;
    Ok(())
}
