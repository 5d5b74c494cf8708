// Threshold scan example
//
// Drives a mock AMC13 through a threshold scan. A feeder thread plays the
// part of the trigger generator and bumps the L1A counter; the scan timer
// notices when each point has its triggers and notifies the coordinator.

use amc13_manager::{
    CardConfig, CommandGateway, LifecycleController, MockBoard, MockFactory, MockUpstream,
    ScanType, SignalChannel, TriggerConfig,
};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "scan_run")]
#[command(version = "1.0")]
#[command(about = "Run a threshold scan against a simulated AMC13")]
struct Args {
    /// Number of scan points
    #[arg(short, long, default_value_t = 3)]
    points: u32,

    /// Triggers per scan point
    #[arg(short, long, default_value_t = 500)]
    triggers: u64,

    /// Triggers added by the simulated generator every 10 ms
    #[arg(short, long, default_value_t = 50)]
    rate: u64,

    /// Gate triggers through LEMO instead of the continuous generator
    #[arg(long)]
    lemo: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut trigger = TriggerConfig::local()
        .periodic_period(100)
        .continuous_on_command();
    if args.lemo {
        trigger = trigger.lemo();
    }
    let config = CardConfig {
        card_name: "gem.shelf01.amc13".to_string(),
        amc_input_enable_list: "1-4".to_string(),
        enable_local_ttc: true,
        local_trigger: trigger,
        bgo: vec![SignalChannel::on(0).command(0x14).bunch_crossing(3000).repeating()],
        ..CardConfig::default()
    };

    let board = MockBoard::new();
    let upstream = Arc::new(MockUpstream::new());
    let controller = Arc::new(LifecycleController::new(
        &config,
        Arc::new(MockFactory::new(board.clone())),
        upstream.clone(),
    )?);
    let gateway = CommandGateway::new(Arc::clone(&controller), upstream.clone(), "scan_run");

    println!("AMC13 Threshold Scan");
    println!("====================");
    println!("Points: {}, triggers per point: {}\n", args.points, args.triggers);

    controller.set_scan(ScanType::Threshold, args.triggers)?;
    controller.initialize()?;
    controller.configure()?;

    // Simulated trigger source: counts only while some trigger path is open.
    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
        let board = board.clone();
        let running = Arc::clone(&running);
        let rate = args.rate;
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                if board.continuous_running() || board.lemo_gate() {
                    board.add_triggers(rate);
                }
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let started = Instant::now();
    controller.start()?;
    for point in 1..=args.points {
        let expected = point as usize;
        while upstream.commands().len() < expected {
            thread::sleep(Duration::from_millis(20));
        }
        println!(
            "Point {:>3} complete after {:>6.2?}, L1A counter {}",
            point,
            started.elapsed(),
            board.l1a_count()
        );
        if point < args.points {
            // The coordinator moves on to the next threshold and re-arms triggers.
            println!("  -> {}", gateway.handle("enableTriggers")?);
        }
    }

    controller.stop()?;
    running.store(false, Ordering::Relaxed);
    let _ = feeder.join();

    println!("\nStatus: {}", controller.status()?.to_json()?);
    controller.reset()?;
    println!("Exclusion violations: {}", board.exclusion_violations());
    Ok(())
}
