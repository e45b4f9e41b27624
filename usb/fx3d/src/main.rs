//! The FX3 capture daemon
//!
//! Brings the board up (downloading the streaming firmware when the device sits in its bootloader),
//! programs the NT1065, then streams raw samples from the configured endpoint into a file while
//! logging device telemetry at a fixed interval.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use log::{error, info, warn};

use common::Timeout;
use fx3_interface::config::{CaptureConfig, Fx3Config};
use fx3_interface::nusb_backend::NusbBus;
use fx3_interface::BringUp;

const USAGE: &str = "fx3d [config.toml]";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM into a flag so the capture loop can stop the stream and reset the
/// device on the way out.
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            warn!("cannot install handler for signal {}", signal);
        }
    }
}

fn keep_capturing(deadline: Option<&Timeout>) -> bool {
    !INTERRUPTED.load(Ordering::SeqCst) && !deadline.map_or(false, Timeout::expired)
}

fn write_samples(output: Option<PathBuf>, rx: Receiver<Vec<u8>>) -> io::Result<u64> {
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::sink()),
    };
    let mut written = 0;
    for chunk in rx {
        out.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    out.flush()?;
    Ok(written)
}

fn load_config(path: Option<&Path>) -> Fx3Config {
    let path = match path {
        Some(path) => path,
        None => return Fx3Config::default(),
    };
    match Fx3Config::load(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fx3d: {}", err);
            eprintln!("usage: {}", USAGE);
            process::exit(1);
        }
    }
}

fn capture(config: &Fx3Config) -> Result<(), String> {
    let bus = NusbBus::new(config.device.control_timeout());
    let mut fx3 = BringUp::new(&bus, config)
        .run()
        .map_err(|err| format!("bring-up failed ({}): {}", err.code().as_str(), err))?;

    let capture: &CaptureConfig = &config.capture;
    let (tx, rx) = bounded::<Vec<u8>>(capture.channel_depth.max(1));
    let output = capture.output.clone();
    let writer_thread = thread::Builder::new()
        .name("fx3-writer".to_string())
        .spawn(move || write_samples(output, rx))
        .map_err(|err| format!("cannot spawn writer: {}", err))?;

    let dropped = Arc::new(AtomicU64::new(0));
    let handler_dropped = Arc::clone(&dropped);
    let handler = move |data: &[u8]| match tx.try_send(data.to_vec()) {
        Ok(()) => (),
        Err(TrySendError::Full(_)) => {
            handler_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Disconnected(_)) => (),
    };

    fx3.start_read(config.stream.endpoint, &config.stream.params(), handler)
        .map_err(|err| format!("cannot start streaming: {}", err))?;

    let deadline = capture.duration().map(Timeout::new);
    let full_every = capture.full_report_every.max(1);
    let mut tick = 0u32;
    while fx3.is_streaming() {
        thread::sleep(capture.telemetry_interval());
        tick = tick.wrapping_add(1);

        let snapshot = fx3.debug_info(tick % full_every != 0);
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!("telemetry {}", json),
            Err(err) => warn!("cannot encode telemetry: {}", err),
        }
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            warn!("writer fell behind, {} transfers dropped", lost);
        }

        if !keep_capturing(deadline.as_ref()) {
            if INTERRUPTED.load(Ordering::SeqCst) {
                info!("interrupted, stopping capture");
            }
            break;
        }
    }

    // Stopping drops the handler and with it the sender, which ends the writer.
    let stopped = fx3.stop_read();
    match writer_thread.join() {
        Ok(Ok(written)) => info!("{} bytes written", written),
        Ok(Err(err)) => error!("writer failed: {}", err),
        Err(_) => error!("writer panicked"),
    }
    stopped.map_err(|err| format!("stream ended with error: {}", err))?;

    fx3.close().map_err(|err| format!("cannot reset device: {}", err))
}

fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref());

    if let Err(err) = common::setup_logging(
        config.capture.log_file.as_deref(),
        common::output_level(),
        common::file_level(),
    ) {
        eprintln!("fx3d: failed to set up logging: {}", err);
    }

    install_signal_handlers();
    if let Err(err) = capture(&config) {
        error!("{}", err);
        process::exit(1);
    }
}
