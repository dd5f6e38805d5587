use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use clap::Parser;

use multiscope::{AcquisitionPoller, AcquisitionSession, Notification, RetentionPolicy, SessionConfig};
use multiscope::sim::SimulatedScope;

/// Run the acquisition engine against simulated oscilloscopes.
#[derive(Debug, Parser)]
struct Args {
    /// JSON session configuration; overrides --window-ms and --history
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    scopes: usize,
    #[arg(long, default_value_t = 4)]
    channels: usize,
    /// Synchronization window in milliseconds
    #[arg(long, default_value_t = 5)]
    window_ms: u64,
    /// Number of events to keep in history
    #[arg(long, default_value_t = 100)]
    history: usize,
    /// Capture once instead of continuously
    #[arg(long)]
    single: bool,
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Clock offset added per scope, in nanoseconds
    #[arg(long, default_value_t = 3)]
    skew_ns: i64,
    /// Make the last scope never trigger, forcing the group into free-run
    #[arg(long)]
    stall_last: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_micros()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => SessionConfig::new(Duration::from_millis(args.window_ms),
            RetentionPolicy::MaxEntries(args.history)),
    };
    log::info!("config: {:?}", config);

    let mut session = AcquisitionSession::new(config);
    for index in 0..args.scopes {
        let mut scope = SimulatedScope::new(&format!("sim{}", index), args.channels)
            .with_clock_offset(index as i64 * args.skew_ns * 1_000_000)
            .with_frequency(1e6 * (index + 1) as f32);
        if args.stall_last && args.scopes > 1 && index + 1 == args.scopes {
            scope = scope.never_triggering();
        }
        session.add_instrument(Box::new(scope));
    }
    let notifications = session.subscribe();

    let (poller, handle) = AcquisitionPoller::new(session);
    let poller_thread = poller.run();
    handle.arm(args.single)?;

    // stand-in for a renderer: read the published channels whenever a new event lands
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut last_report = Instant::now();
    while Instant::now() < deadline {
        match notifications.recv_timeout(Duration::from_millis(100)) {
            Ok(Notification::AcquisitionPublished { trigger_time, flags, .. }) => {
                let channels = handle.gate().enter().channels();
                log::debug!("consumer: event at {} ({:?}), {} channels visible",
                    trigger_time, flags, channels.len());
            }
            Ok(Notification::FreeRunEngaged { missing }) =>
                log::warn!("consumer: free-run engaged, {:?} did not trigger", missing),
            Ok(_) => (),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = handle.status()?;
            log::info!("status: {:?}, {:.1} WFM/s, {} total, {} in history",
                status.trigger, status.waveform_rate.unwrap_or(0.0),
                status.total_waveforms, status.history_entries);
            last_report = Instant::now();
        }
    }

    handle.stop()?;
    println!("{}", serde_json::to_string_pretty(&handle.serialize()?)?);
    handle.shutdown();
    poller_thread.join()
        .expect("acquisition thread panicked")?;
    Ok(())
}
