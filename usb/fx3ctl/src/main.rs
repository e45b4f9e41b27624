use std::path::{Path, PathBuf};
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches};

use fx3_interface::config::Fx3Config;
use fx3_interface::endpoint::{enumerate, scan, ScanReport};
use fx3_interface::nusb_backend::{NusbBus, NusbHandle};
use fx3_interface::nt1065;
use fx3_interface::script;
use fx3_interface::telemetry::Telemetry;
use fx3_interface::{Fx3Device, RegisterAccess, UsbBus};

fn parse_num(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid number {:?}: {}", text, err))
}

fn num_arg<T: TryFrom<u32>>(matches: &ArgMatches, name: &str) -> Result<T, String> {
    let text = matches
        .value_of(name)
        .ok_or_else(|| format!("missing {}", name))?;
    let value = parse_num(text)?;
    T::try_from(value).map_err(|_| format!("{} out of range: {}", name, text))
}

fn report_json(report: &ScanReport) -> serde_json::Value {
    serde_json::json!({
        "mode": format!("{:?}", report.mode()),
        "loadable": report.loadable,
        "streamable": report.streamable,
        "stream": report.stream,
        "boot": report.boot,
    })
}

fn open_streaming(bus: &NusbBus, config: &Fx3Config) -> Result<NusbHandle, String> {
    let report = scan(bus, &config.device.ids()).map_err(|err| err.to_string())?;
    report.check().map_err(|err| err.to_string())?;
    let ident = report
        .stream
        .ok_or_else(|| "no device running the streaming firmware".to_string())?;
    bus.open(&ident).map_err(|err| err.to_string())
}

fn load_config(path: Option<&str>) -> Result<Fx3Config, String> {
    match path {
        Some(path) => Fx3Config::load(Path::new(path)).map_err(|err| err.to_string()),
        None => Ok(Fx3Config::default()),
    }
}

fn run(matches: &ArgMatches) -> Result<(), String> {
    let config = load_config(matches.value_of("CONFIG"))?;
    let bus = NusbBus::new(config.device.control_timeout());

    match matches.subcommand() {
        ("scan", _) => {
            let report = scan(&bus, &config.device.ids()).map_err(|err| err.to_string())?;
            println!("{}", report_json(&report));
        }
        ("endpoints", _) => {
            let mut handle = open_streaming(&bus, &config)?;
            let endpoints =
                enumerate(&mut handle, &config.device.ids()).map_err(|err| err.to_string())?;
            let json = serde_json::to_string_pretty(&endpoints[..]).map_err(|err| err.to_string())?;
            println!("{}", json);
        }
        ("reg", Some(sub)) => {
            let handle = open_streaming(&bus, &config)?;
            let address: u8 = num_arg(sub, "ADDRESS")?;
            match sub.value_of("VALUE") {
                Some(_) => {
                    let value: u8 = num_arg(sub, "VALUE")?;
                    handle
                        .write_register16(value, address)
                        .map_err(|err| err.to_string())?;
                }
                None => println!("{}", handle.dump_register(address).map_err(|err| err.to_string())?),
            }
        }
        ("reg24", Some(sub)) => {
            let handle = open_streaming(&bus, &config)?;
            let address: u16 = num_arg(sub, "ADDRESS")?;
            match sub.value_of("VALUE") {
                Some(_) => {
                    let value: u8 = num_arg(sub, "VALUE")?;
                    handle.poke8(address, value).map_err(|err| err.to_string())?;
                }
                None => {
                    let value = handle
                        .read_register24(address)
                        .map_err(|err| err.to_string())?;
                    println!("{:#06x} = {:#04x}", address, value);
                }
            }
        }
        ("gpio", Some(sub)) => {
            let handle = open_streaming(&bus, &config)?;
            let line: u16 = num_arg(sub, "LINE")?;
            match sub.value_of("VALUE") {
                Some(_) => {
                    let value: u16 = num_arg(sub, "VALUE")?;
                    handle.write_gpio(line, value).map_err(|err| err.to_string())?;
                }
                None => {
                    let value = handle.read_gpio(line).map_err(|err| err.to_string())?;
                    println!("{}", value);
                }
            }
        }
        ("reset", _) => {
            let handle = open_streaming(&bus, &config)?;
            let fx3 = Fx3Device::new(handle, Default::default())
                .with_reset_wait(config.device.reset_wait());
            fx3.close().map_err(|err| err.to_string())?;
        }
        ("debug-info", _) => {
            let handle = open_streaming(&bus, &config)?;
            let mut telemetry = Telemetry::new(Default::default());
            let snapshot = telemetry.snapshot(&handle, false);
            let json = serde_json::to_string_pretty(&snapshot).map_err(|err| err.to_string())?;
            println!("{}", json);
        }
        ("chip-id", _) => {
            let handle = open_streaming(&bus, &config)?;
            let id = nt1065::chip_id(&handle).map_err(|err| err.to_string())?;
            println!("{:08X}", id);
        }
        ("load-script", Some(sub)) => {
            let handle = open_streaming(&bus, &config)?;
            let path = PathBuf::from(sub.value_of("SCRIPT").unwrap_or_default());
            let text = std::fs::read_to_string(&path)
                .map_err(|err| format!("cannot read {}: {}", path.display(), err))?;
            let writes = script::parse(&text).map_err(|err| err.to_string())?;
            let applied = script::apply_writes(
                &handle,
                &writes,
                config.firmware.stop_address,
                config.firmware.write_delay(),
            )
            .map_err(|err| err.to_string())?;
            println!("{} of {} writes applied", applied, writes.len());
        }
        _ => return Err(matches.usage().to_string()),
    }
    Ok(())
}

fn main() {
    let matches = App::new("fx3ctl")
        .setting(AppSettings::SubcommandRequired)
        .arg(
            Arg::with_name("CONFIG")
                .takes_value(true)
                .long("config")
                .short("c"),
        )
        .subcommand(App::new("scan"))
        .subcommand(App::new("endpoints"))
        .subcommand(
            App::new("reg")
                .arg(Arg::with_name("ADDRESS").takes_value(true).required(true))
                .arg(Arg::with_name("VALUE").takes_value(true)),
        )
        .subcommand(
            App::new("reg24")
                .arg(Arg::with_name("ADDRESS").takes_value(true).required(true))
                .arg(Arg::with_name("VALUE").takes_value(true)),
        )
        .subcommand(
            App::new("gpio")
                .arg(Arg::with_name("LINE").takes_value(true).required(true))
                .arg(Arg::with_name("VALUE").takes_value(true)),
        )
        .subcommand(App::new("reset"))
        .subcommand(App::new("debug-info"))
        .subcommand(App::new("chip-id"))
        .subcommand(
            App::new("load-script").arg(Arg::with_name("SCRIPT").takes_value(true).required(true)),
        )
        .get_matches();

    if let Err(err) = common::setup_logging(None, common::output_level(), common::file_level()) {
        eprintln!("fx3ctl: failed to set up logging: {}", err);
    }

    if let Err(err) = run(&matches) {
        eprintln!("fx3ctl: {}", err);
        process::exit(1);
    }
}
