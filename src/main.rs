use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use cli::Cli;
use flowmark::conntrack::netlink::NetlinkSource;
use flowmark::conntrack::ConntrackWorker;
use flowmark::queue::QueueWorker;
use flowmark::{ConnectionTable, MarkMask, RuleSet};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let mask = MarkMask::new(cli.mark_mask)
        .context("the mark mask must only have consecutive bits on (e.g. 0x0ff0, not 0xf0f0)")?;

    if unsafe { libc::geteuid() } != 0 {
        bail!("this program requires root privileges (kernel queue and conntrack bindings)");
    }

    let rules = Arc::new(RuleSet::load(&cli.rules)?);
    let table = Arc::new(ConnectionTable::new(rules));

    let stop = Arc::new(AtomicBool::new(false));
    flowmark::shutdown::install(stop.clone());

    // Open the conntrack socket before spawning anything: a missing
    // nf_conntrack_netlink is a startup failure, not a runtime one.
    let mut source = NetlinkSource::open().context("cannot subscribe to conntrack events")?;

    let mut conntrack = ConntrackWorker::new(table.clone(), stop.clone());
    let conntrack_stop = stop.clone();
    let conntrack_thread = thread::spawn(move || {
        let result = conntrack.run(&mut source);
        if let Err(e) = &result {
            error!("conntrack worker failed: {}", e);
            conntrack_stop.store(true, Ordering::SeqCst);
        }
        info!("conntrack thread is exiting");
        result
    });

    let mut queue = QueueWorker::new(table, mask, cli.queue, stop.clone());
    let queue_stop = stop;
    let queue_thread = thread::spawn(move || {
        let result = queue.run();
        if let Err(e) = &result {
            error!("queue worker failed: {}", e);
            queue_stop.store(true, Ordering::SeqCst);
        }
        info!("queue thread is exiting");
        result
    });

    let queue_result = queue_thread
        .join()
        .map_err(|_| anyhow!("queue thread panicked"))?;
    let conntrack_result = conntrack_thread
        .join()
        .map_err(|_| anyhow!("conntrack thread panicked"))?;

    queue_result?;
    conntrack_result?;
    Ok(())
}
