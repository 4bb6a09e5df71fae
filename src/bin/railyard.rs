//! Launcher: start an event system and serve it over TCP.

use std::env;
use std::process;
use std::thread;
use std::time::Duration;

use railyard::constants::DEFAULT_SERVER_PORT;
use railyard::{EventSystem, Server, SystemConfig};

fn usage() {
    eprintln!(
        "\nUsage:\n   railyard [-n <# of events>]\n            [-s <size of events (bytes)>]\n            [-p <server port>]\n            [-g <group sizes, comma separated>]\n            [-debug]\n            [-h]\n"
    );
}

fn parse_or_die<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.and_then(|v| v.parse().ok()) {
        Some(parsed) => parsed,
        None => {
            eprintln!("bad value for {flag}");
            usage();
            process::exit(1);
        }
    }
}

fn main() {
    let mut config = SystemConfig::default();
    let mut port = DEFAULT_SERVER_PORT;
    let mut debug = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => {
                usage();
                process::exit(0);
            }
            "-n" => config.num_events = parse_or_die("-n", args.next()),
            "-s" => config.event_size = parse_or_die("-s", args.next()),
            "-p" => port = parse_or_die("-p", args.next()),
            "-g" => {
                let sizes: String = parse_or_die("-g", args.next());
                let mut groups = Vec::new();
                for part in sizes.split(',') {
                    groups.push(parse_or_die("-g", Some(part.to_string())));
                }
                config.groups = groups;
            }
            "-debug" => debug = true,
            _ => {
                usage();
                process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let system = match EventSystem::new(config) {
        Ok(system) => system,
        Err(err) => {
            eprintln!("error starting event system: {err}");
            process::exit(1);
        }
    };
    let _server = match Server::spawn(system.clone(), &format!("0.0.0.0:{port}")) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("error starting protocol server: {err}");
            process::exit(1);
        }
    };

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
