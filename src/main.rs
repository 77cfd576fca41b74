use std::{process, thread, time::Duration};

use anyhow::Result;
use env_logger::Env;
use tokio::task::LocalSet;

use kloak::{config::Config, service::Service};

pub fn main() {
    // init logging
    let env = Env::default().filter_or("KLOAK_LOG_LEVEL", "info");
    env_logger::init_from_env(env);

    if let Err(e) = run() {
        eprintln!("FATAL ERROR: {e:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = Config::parse()?;

    // let the session settle before the devices are exclusively grabbed
    if config.start_delay > 0 {
        thread::sleep(Duration::from_millis(u64::from(config.start_delay)));
    }

    // single threaded runtime; the whole daemon is one cooperative loop
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    runtime.block_on(LocalSet::new().run_until(async {
        let service = Service::new(&config)?;
        log::info!("all input is being anonymized; press the escape combo to exit");
        service.run().await
    }))
}
