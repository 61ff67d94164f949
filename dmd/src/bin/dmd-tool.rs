//! Administrative CLI for `dmd`, talking to the daemon purely over D-Bus.
//! This binary shares no modules with `dmd` itself — there is no `[lib]`
//! target to share them through — so the proxy definition below is a
//! self-contained mirror of `org.freedesktop.DisplayManager`'s method
//! and property signatures.

use std::process::ExitCode;

use zbus::dbus_proxy;

#[dbus_proxy(
    interface = "org.freedesktop.DisplayManager",
    default_path = "/org/freedesktop/DisplayManager"
)]
trait DisplayManager {
    fn switch_to_greeter(&self, seat: &str) -> zbus::Result<()>;
    fn switch_to_user(&self, seat: &str, username: &str, session: &str) -> zbus::Result<()>;
    fn switch_to_guest(&self, seat: &str, session: &str) -> zbus::Result<()>;
    fn lock(&self, seat: &str) -> zbus::Result<()>;
    fn add_local_x_seat(&self, vt: i32) -> zbus::Result<()>;
    fn add_seat(&self, seat_type: &str, properties: Vec<(String, String)>) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn seats(&self) -> zbus::Result<Vec<String>>;
    #[dbus_proxy(property)]
    fn sessions(&self) -> zbus::Result<Vec<String>>;
}

fn print_usage(program: &str) {
    eprintln!(
        "Usage: {program} [--seat NAME] <command> [args...]\n\n\
         Commands:\n  \
         switch-to-greeter\n  \
         switch-to-user USER [SESSION]\n  \
         switch-to-guest [SESSION]\n  \
         lock\n  \
         list-seats\n  \
         add-seat TYPE [KEY=VALUE...]\n  \
         add-local-x-seat N\n"
    );
}

const DEFAULT_SEAT: &str = "seat0";

#[tokio::main]
async fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let program = std::env::args().next().unwrap_or_else(|| "dmd-tool".into());

    let mut seat = DEFAULT_SEAT.to_string();
    if args.first().map(|a| a.as_str()) == Some("--seat") {
        if args.len() < 2 {
            print_usage(&program);
            return ExitCode::FAILURE;
        }
        seat = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        print_usage(&program);
        return ExitCode::FAILURE;
    }

    let connection = match zbus::Connection::system().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to connect to the system bus: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let proxy = match DisplayManagerProxy::new(&connection).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to build D-Bus proxy: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args[0].as_str() {
        "switch-to-greeter" => proxy.switch_to_greeter(&seat).await,
        "switch-to-user" => {
            if args.len() < 2 {
                eprintln!("switch-to-user requires a USER argument");
                return ExitCode::FAILURE;
            }
            let session = args.get(2).map(String::as_str).unwrap_or("");
            proxy.switch_to_user(&seat, &args[1], session).await
        }
        "switch-to-guest" => {
            let session = args.get(1).map(String::as_str).unwrap_or("");
            proxy.switch_to_guest(&seat, session).await
        }
        "lock" => proxy.lock(&seat).await,
        "list-seats" => match list_seats(&proxy).await {
            Ok(()) => return ExitCode::SUCCESS,
            Err(e) => Err(e),
        },
        "add-seat" => {
            if args.len() < 2 {
                eprintln!("add-seat requires a TYPE argument");
                return ExitCode::FAILURE;
            }
            let properties = match parse_kv_pairs(&args[2..]) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            proxy.add_seat(&args[1], properties).await
        }
        "add-local-x-seat" => {
            if args.len() < 2 {
                eprintln!("add-local-x-seat requires a VT number argument");
                return ExitCode::FAILURE;
            }
            let vt: i32 = match args[1].parse() {
                Ok(vt) => vt,
                Err(_) => {
                    eprintln!("invalid VT number: {}", args[1]);
                    return ExitCode::FAILURE;
                }
            };
            proxy.add_local_x_seat(vt).await
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage(&program);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_kv_pairs(args: &[String]) -> Result<Vec<(String, String)>, String> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", arg))
        })
        .collect()
}

async fn list_seats(proxy: &DisplayManagerProxy<'_>) -> zbus::Result<()> {
    let seats = proxy.seats().await?;
    let sessions = proxy.sessions().await?;
    for seat in seats {
        let user = sessions
            .iter()
            .find_map(|s| s.strip_prefix(&format!("{}=", seat)));
        match user {
            Some(user) => println!("{}: {}", seat, user),
            None => println!("{}: (no active session)", seat),
        }
    }
    Ok(())
}
