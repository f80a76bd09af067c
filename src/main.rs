use std::env;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::channel;

use wmbus2json::bus::{strip_any_link_crcs, BusManager, DetectScope};
use wmbus2json::config::{parse_bus_uri, Config, MeterConfig};
use wmbus2json::meters::MeterManager;
use wmbus2json::output::{render_analyze, Format, Transmission};
use wmbus2json::{drivers, telegram, LinkModeSet};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    println!(
        "usage: wmbus2json [options] <device> [<name> <driver> <idexpr> <key|NOKEY>]\n\
         \n\
         --useconfig=<root>     load configuration tree from <root>\n\
         --analyze[=drv:key]    score every driver against telegrams from stdin\n\
         --listento=<modes>     link modes to listen to, eg c1,t1\n\
         --exitafter=<dur>      stop after this long, eg 30m\n\
         --oneshot              exit once every meter has been updated\n\
         --format=<hr|json|fields>\n\
         --separator=<c>        separator for the fields format\n\
         --logtelegrams         print each raw telegram\n\
         --loglevel=<silent|normal|verbose|debug|trace>\n\
         --ignoreduplicates     drop identical back to back telegrams\n\
         --list-meters          print all driver names\n\
         --list-fields=<drv>    print the fields a driver extracts\n\
         --list-units           print the known units\n\
         --version              print version and exit"
    );
}

fn loglevel_to_filter(level: &str) -> &'static str {
    match level {
        "silent" => "off",
        "verbose" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "warn",
    }
}

fn list_meters() {
    for d in drivers::all_drivers() {
        println!("{}", d.name);
    }
}

fn list_fields(name: &str) {
    match drivers::find_driver(name) {
        None => println!("no such driver {name}"),
        Some(d) => {
            for f in &d.fields {
                println!("{:40} {}", f.vname, f.help);
            }
        }
    }
}

fn list_units() {
    for q in [
        wmbus2json::Quantity::Energy,
        wmbus2json::Quantity::Volume,
        wmbus2json::Quantity::Power,
        wmbus2json::Quantity::Flow,
        wmbus2json::Quantity::Temperature,
        wmbus2json::Quantity::Voltage,
        wmbus2json::Quantity::Amperage,
        wmbus2json::Quantity::Time,
        wmbus2json::Quantity::PointInTime,
        wmbus2json::Quantity::Counter,
    ] {
        println!("{:?} default unit {}", q, q.default_unit());
    }
}

/// Run analyze mode: read hex telegrams from stdin, score every driver.
async fn run_analyze(spec: Option<String>) {
    use tokio::io::{stdin, AsyncBufReadExt, BufReader};

    let (forced_driver, key) = match spec {
        None => (None, None),
        Some(s) => {
            let mut parts = s.split(':');
            let driver = parts.next().filter(|d| !d.is_empty()).map(|d| d.to_string());
            let key = parts.next().and_then(|k| hex::decode(k).ok());
            (driver, key)
        }
    };

    let mut lines = BufReader::new(stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let hexstr: String = line
            .trim()
            .trim_start_matches("telegram=")
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect();
        let Ok(frame) = hex::decode(&hexstr) else { continue };
        let Some(frame) = strip_any_link_crcs(&frame) else { continue };
        match drivers::analyze(
            &frame,
            telegram::AboutTelegram::new("analyze", 0),
            forced_driver.as_deref(),
            key.as_deref(),
        ) {
            Ok(report) => println!("{}", render_analyze(&report)),
            Err(e) => warn!("analyze failed: {e}"),
        }
    }
}

fn parse_args(mut config: Config) -> Option<(Config, Option<String>, bool)> {
    let mut analyze = None;
    let mut run_analyze_mode = false;
    let mut positional: Vec<String> = Vec::new();

    for arg in env::args().skip(1) {
        if arg == "--version" {
            println!("wmbus2json {VERSION}");
            return None;
        }
        if arg == "--license" {
            println!("wmbus2json is free software, see the LICENSE file");
            return None;
        }
        if arg == "--help" || arg == "-h" {
            print_usage();
            return None;
        }
        if arg == "--list-meters" {
            list_meters();
            return None;
        }
        if arg == "--list-units" {
            list_units();
            return None;
        }
        if let Some(d) = arg.strip_prefix("--list-fields=") {
            list_fields(d);
            return None;
        }
        if let Some(root) = arg.strip_prefix("--useconfig=") {
            match Config::load(root) {
                Ok(c) => config = c,
                Err(e) => {
                    eprintln!("could not load config from {root}: {e}");
                    return None;
                }
            }
            continue;
        }
        if arg == "--analyze" {
            run_analyze_mode = true;
            continue;
        }
        if let Some(spec) = arg.strip_prefix("--analyze=") {
            run_analyze_mode = true;
            analyze = Some(spec.to_string());
            continue;
        }
        if let Some(modes) = arg.strip_prefix("--listento=") {
            match LinkModeSet::parse(modes) {
                Some(lms) => config.listento = lms,
                None => {
                    eprintln!("invalid link modes {modes}");
                    return None;
                }
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("--exitafter=") {
            config.exitafter = v.trim_end_matches('m').parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
            continue;
        }
        if arg == "--oneshot" {
            config.oneshot = true;
            continue;
        }
        if let Some(v) = arg.strip_prefix("--format=") {
            match Format::parse(v) {
                Some(f) => config.format = f,
                None => {
                    eprintln!("unknown format {v}");
                    return None;
                }
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("--separator=") {
            config.separator = v.chars().next().unwrap_or(';');
            continue;
        }
        if arg == "--logtelegrams" {
            config.logtelegrams = true;
            continue;
        }
        if arg == "--ignoreduplicates" {
            config.ignoreduplicates = true;
            continue;
        }
        if let Some(v) = arg.strip_prefix("--loglevel=") {
            config.loglevel = v.to_string();
            continue;
        }
        if arg.starts_with("--") {
            eprintln!("unknown option {arg}");
            return None;
        }
        positional.push(arg);
    }

    /* First positional args that look like devices become buses, then an
       ad-hoc meter quad: name driver idexpr key. */
    let mut rest = Vec::new();
    for p in positional {
        if rest.is_empty()
            && (p.starts_with('/') || p == "stdin" || p.starts_with("file:")
                || p.starts_with("sim:") || p.starts_with("rtlwmbus") || p.starts_with("rtl433"))
        {
            match parse_bus_uri(&p) {
                Ok(spec) => config.devices.push(spec),
                Err(e) => {
                    eprintln!("{e}");
                    return None;
                }
            }
        } else {
            rest.push(p);
        }
    }
    if rest.len() == 4 {
        let mc = MeterConfig {
            name: rest[0].clone(),
            driver: rest[1].clone(),
            ids: rest[2].clone(),
            key: rest[3].clone(),
            ..Default::default()
        };
        config.meters.push(mc);
    } else if !rest.is_empty() {
        eprintln!("an ad-hoc meter needs exactly: <name> <driver> <idexpr> <key|NOKEY>");
        return None;
    }

    Some((config, analyze, run_analyze_mode))
}

#[tokio::main]
async fn main() {
    let default_filter = std::env::var("WMBUS2JSON_LOG_LEVEL").unwrap_or("warn".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let Some((config, analyze_spec, analyze_mode)) = parse_args(Config::default()) else {
        return;
    };
    log::set_max_level(match loglevel_to_filter(&config.loglevel) {
        "off" => log::LevelFilter::Off,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    });

    if analyze_mode {
        run_analyze(analyze_spec).await;
        return;
    }

    /* Frames flow from the buses into the decoder loop, updates flow from
       the decoder into the printer task. */
    let (frame_tx, mut frame_rx) = channel(128);
    let (update_tx, mut update_rx) = channel(128);
    let shutdown_tx = update_tx.clone();

    let mut meter_manager = MeterManager::new(update_tx);
    meter_manager.ignore_duplicates = config.ignoreduplicates;
    meter_manager.auto_mode = config.meters.is_empty();
    for mc in &config.meters {
        match mc.build() {
            Ok(m) => {
                info!("meter {} using driver {}", m.name, m.driver.name);
                meter_manager.add_meter(m);
            }
            Err(e) => {
                eprintln!("bad meter configuration: {e}");
                return;
            }
        }
    }

    /* The union of listento and what the configured drivers advertise. */
    let wanted_modes = config.listento.union(meter_manager.wanted_link_modes());

    let mut bus_manager = BusManager::new(frame_tx);
    bus_manager.donotprobe = config.donotprobe.clone();
    bus_manager.resetafter = config.resetafter;
    let scope = DetectScope::All;
    bus_manager.detect_and_configure(&config.devices, wanted_modes, scope).await;
    if config.devices.is_empty() {
        warn!("no bus devices configured, reading from stdin");
        let spec = parse_bus_uri("stdin").expect("stdin is always a valid bus");
        bus_manager.detect_and_configure(&[spec], wanted_modes, scope).await;
    }

    /* Printer task: renders according to the configured format and runs
       the per-telegram shell with the exported environment. */
    let format = config.format;
    let logtelegrams = config.logtelegrams;
    let printer = tokio::spawn(async move {
        while let Some(t) = update_rx.recv().await {
            match t {
                Transmission::Update(u) => {
                    match format {
                        Format::Json => {
                            println!("{}", serde_json::Value::Object(u.json.clone()));
                        }
                        Format::Fields => println!("{}", u.fields_line),
                        Format::Hr => println!("{}", u.hr_line),
                    }
                    if let Some(shell) = &u.shell {
                        let mut cmd = tokio::process::Command::new("/bin/sh");
                        cmd.arg("-c").arg(shell);
                        for (k, v) in &u.envs {
                            cmd.env(k, v);
                        }
                        match cmd.status().await {
                            Ok(status) if !status.success() => {
                                warn!("({}) shell exited with {status}", u.meter_name)
                            }
                            Ok(_) => {}
                            Err(e) => warn!("({}) shell failed: {e}", u.meter_name),
                        }
                    }
                }
                Transmission::Shutdown => break,
            }
        }
    });

    /* The two second checkup drives hot plug scans and the send queue.
       The bus manager stays on this task, frames keep flowing meanwhile. */
    let mut checkup = tokio::time::interval(Duration::from_secs(2));
    let started = std::time::Instant::now();
    let exitafter = config.exitafter;

    loop {
        tokio::select! {
            maybe_frame = frame_rx.recv() => {
                let Some((about, frame)) = maybe_frame else { break };
                if logtelegrams {
                    println!("telegram=|{}|", hex::encode_upper(&frame));
                }
                let Some(stripped) = strip_any_link_crcs(&frame) else { continue };
                let handled = meter_manager.handle_frame(&stripped, about).await;
                if !handled {
                    debug!("telegram without matching meter");
                }
                if config.oneshot && meter_manager.all_meters_updated() {
                    info!("oneshot done, all meters have reported");
                    break;
                }
            }
            _ = checkup.tick() => {
                bus_manager.regular_checkup().await;
                if let Some(limit) = exitafter {
                    if started.elapsed() >= limit {
                        info!("exitafter reached, shutting down");
                        break;
                    }
                }
            }
        }
    }

    bus_manager.close_all().await;
    let _ = shutdown_tx.send(Transmission::Shutdown).await;
    let _ = printer.await;
}
