//! Entry point: parse arguments, set up logging, load configuration, and
//! run until a shutdown signal. No `lib.rs` — `dmd-tool` is a fully
//! separate binary with its own D-Bus client, so nothing here needs to
//! be reusable outside this crate.

mod child;
mod config;
mod daemon;
mod dbus;
mod display;
mod display_server;
mod dmrc;
mod error;
mod greeter_socket;
mod guest;
mod pam;
mod privilege;
mod reaper;
mod seat;
mod session;
mod session_descriptor;
mod vt;
mod xauthority;

use std::path::PathBuf;
use std::process::ExitCode;

use daemon::DaemonRoot;

const DEFAULT_CONFIG_PATH: &str = "/etc/lightdm/lightdm.conf";

fn print_usage(program: &str, opts: &getopts::Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut opts = getopts::Options::new();
    opts.optopt("c", "config", "path to lightdm.conf", "FILE");
    opts.optflag("d", "debug", "enable debug logging");
    opts.optflag("h", "help", "print this help and exit");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program, &opts);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, &opts);
        return ExitCode::SUCCESS;
    }

    let default_filter = if matches.opt_present("d") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    let config_path = matches
        .opt_str("c")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let root = match DaemonRoot::new(&config_path) {
        Ok(root) => root,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    let ctx = root.context();
    let _dbus_connection = match dbus::publish(ctx).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "failed to publish D-Bus interface");
            return ExitCode::FAILURE;
        }
    };

    match root.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon exited with an error");
            ExitCode::FAILURE
        }
    }
}
