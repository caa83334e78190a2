use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gnss_coordinator::alarm::ThreadWakeScheduler;
use gnss_coordinator::clock::{Clock, SystemClock};
use gnss_coordinator::collaborators::{NetworkKind, NetworkStateEvent, ThreadRunner};
use gnss_coordinator::hal::{location_flags, Capabilities, EngineStatus, RawFix, SvInfo, SvStatus};
use gnss_coordinator::mock::{
    MockConnectivity, MockDriver, MockSubscriber, MockTimeSource, MockWakeLock, MockXtraSource,
    RecordingAccounting, RecordingSink,
};
use gnss_coordinator::worker::WakeLock;
use gnss_coordinator::{ChannelObserver, FixRequest, GnssConfig, GnssLocationProvider, Services};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "gnss_sim")]
#[command(about = "Drive the GNSS coordinator against a simulated engine", long_about = None)]
struct Args {
    /// Properties file (KEY=VALUE); defaults are used if missing
    #[arg(long, default_value = "gps.conf")]
    config: PathBuf,

    /// Number of fixes the simulated engine reports
    #[arg(long, default_value = "5")]
    fixes: u32,

    /// Requested fix interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Engine capability bits (1=scheduling, 2=MSB, 4=MSA, 8=single shot, 16=on-demand time)
    #[arg(long, default_value_t = Capabilities::SCHEDULING | Capabilities::MSB)]
    capabilities: u32,

    /// Simulated engine supports ephemeris prefetch
    #[arg(long, default_value_t = false)]
    xtra: bool,

    /// Print the final snapshot as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = GnssConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    log::info!(
        "NTP server {:?}, XTRA servers {:?}, SUPL {:?}",
        config.ntp_server,
        config.xtra_servers,
        config.supl_server
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let scheduler = ThreadWakeScheduler::new(Arc::clone(&clock)).context("Failed to start alarm thread")?;

    let driver = Arc::new(MockDriver::new());
    driver.set_capabilities_on_init(args.capabilities);
    driver.set_supports_xtra(args.xtra);
    driver.set_nmea("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47");
    driver.set_sv_status(SvStatus {
        svs: (1..=8)
            .map(|prn| SvInfo {
                prn,
                snr: 30.0 + prn as f32,
                elevation: 10.0 * prn as f32,
                azimuth: 40.0 * prn as f32,
            })
            .collect(),
        used_in_fix_mask: 0b0011_1111,
        ..SvStatus::default()
    });

    let sink = Arc::new(RecordingSink::new());
    let wake_lock = Arc::new(MockWakeLock::new());
    let services = Services {
        driver: driver.clone(),
        connectivity: Arc::new(MockConnectivity::new()),
        time_source: Arc::new(MockTimeSource::new()),
        xtra_source: Arc::new(MockXtraSource::new()),
        location_sink: sink.clone(),
        accounting: Arc::new(RecordingAccounting::new()),
        subscriber: Arc::new(MockSubscriber::new()),
        scheduler: Arc::new(scheduler),
        clock: Arc::clone(&clock),
        runner: Arc::new(ThreadRunner),
        wake_lock: wake_lock.clone() as Arc<dyn WakeLock>,
    };

    let provider = GnssLocationProvider::new(services, config)?;
    let (observer, events) = ChannelObserver::pair();
    provider.add_listener(observer)?;
    provider.update_network_state(NetworkStateEvent::available(NetworkKind::Other))?;
    provider.enable()?;
    provider.set_request(FixRequest {
        report_location: true,
        interval: Duration::from_millis(args.interval_ms),
    })?;
    provider.flush()?;

    let callbacks = driver
        .callbacks()
        .context("Simulated engine was not initialised")?;
    callbacks.report_status(EngineStatus::SessionBegin);

    for i in 0..args.fixes {
        std::thread::sleep(Duration::from_millis(args.interval_ms.min(200)));
        callbacks.report_sv_status();
        callbacks.report_nmea(clock.current_time_millis());
        callbacks.report_location(RawFix {
            flags: location_flags::HAS_LAT_LONG | location_flags::HAS_ACCURACY | location_flags::HAS_SPEED,
            latitude: 37.4220 + i as f64 * 1e-5,
            longitude: -122.0841,
            speed: 1.4,
            accuracy: 6.0,
            timestamp_ms: clock.current_time_millis(),
            ..RawFix::default()
        });
        provider.flush()?;
        log::info!("Fix {} delivered, status {:?}", i + 1, provider.snapshot().session.status);
    }

    callbacks.report_status(EngineStatus::SessionEnd);
    provider.flush()?;

    let received = events.drain();
    let snapshot = provider.snapshot();
    if args.json {
        let report = json!({
            "snapshot": snapshot,
            "locations": sink.locations(),
            "status_events": received,
            "wake_lock_acquisitions": wake_lock.acquire_count(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Locations reported: {}", sink.locations().len());
        println!("Status events:      {}", received.len());
        println!("TTFF:               {:?} ms", snapshot.session.ttff_ms);
        println!("Status:             {:?} ({} SVs)", snapshot.session.status, snapshot.session.sv_count);
    }

    drop(provider);
    Ok(())
}
