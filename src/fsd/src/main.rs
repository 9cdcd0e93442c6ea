mod daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::daemon::{run_daemon, DaemonRunOptions, DEFAULT_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: fsd <mountpoint> [--config <path>] [--read-only]\n\
         defaults:\n\
         --config {}",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_args() -> Result<DaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mountpoint = PathBuf::from(args[0].clone());
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut read_only = false;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            "--read-only" => {
                read_only = true;
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(DaemonRunOptions {
        mountpoint,
        config_path,
        read_only,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_daemon(options) {
        error!("run fsd failed: {}", err);
        std::process::exit(1);
    }
}
