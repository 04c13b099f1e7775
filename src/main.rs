// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use clap::Parser;

use lessee::{
    install_signal_handlers, ClientConfig, DhcpError, Dispatcher, Duid,
    ErrorKind, ExecScript, Iface, LeaseJournal, ScriptEnv, ScriptReason,
    ScriptRunner,
};

const DEFAULT_LEASE_FILE: &str = "/var/lib/dhclient/dhclient.leases";
const DEFAULT_PID_FILE: &str = "/var/run/dhclient.pid";
const DEFAULT_SCRIPT: &str = "/sbin/dhclient-script";

/// Exit code when one-try mode fails to obtain a lease.
const ONETRY_FAIL_EXIT: i32 = 2;

#[derive(Parser)]
#[command(name = "lessee")]
#[command(about = "IPv4 DHCP client", version)]
struct Cli {
    /// Interfaces to configure. Named interfaces are requested
    /// explicitly rather than picked up automatically.
    interfaces: Vec<String>,

    /// Do not activate any interface.
    #[arg(short = 'n')]
    no_activate: bool,

    /// Release the current lease and exit.
    #[arg(short = 'r')]
    release: bool,

    /// Tell a running instance to exit without releasing.
    #[arg(short = 'x')]
    exit: bool,

    /// Try once to obtain a lease, exit 2 on failure.
    #[arg(short = '1')]
    onetry: bool,

    /// Stay in the foreground.
    #[arg(short = 'd')]
    foreground: bool,

    /// Log less.
    #[arg(short = 'q')]
    quiet: bool,

    /// Daemonize immediately instead of waiting for a lease.
    #[arg(long = "nw")]
    nowait: bool,

    #[arg(long = "lease-file", default_value = DEFAULT_LEASE_FILE)]
    lease_file: PathBuf,

    /// Separate file holding only the default-duid statement.
    #[arg(long = "duid-file")]
    duid_file: Option<PathBuf>,

    #[arg(long = "pid-file", default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Do not write a PID file.
    #[arg(long = "no-pid")]
    no_pid: bool,

    #[arg(long = "script", default_value = DEFAULT_SCRIPT)]
    script: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter(
            None,
            if cli.quiet {
                log::LevelFilter::Warn
            } else {
                log::LevelFilter::Info
            },
        )
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(match e.kind() {
                ErrorKind::NoLease => ONETRY_FAIL_EXIT,
                _ => 1,
            });
        }
    }
}

fn run(cli: Cli) -> Result<i32, DhcpError> {
    if cli.exit {
        return signal_running_instance(cli.pid_file.as_path());
    }

    let mut journal = LeaseJournal::new(cli.lease_file.as_path());
    journal.recover()?;

    if let Some(duid_file) = cli.duid_file.as_deref() {
        let mut duid_journal = LeaseJournal::new(duid_file);
        duid_journal.recover()?;
        if let Some(duid) = duid_journal.duid() {
            journal.set_duid(duid.clone());
        }
    }

    let script: Box<dyn ScriptRunner> = Box::new(ExecScript::new(
        cli.script.to_string_lossy().as_ref(),
    ));
    let mut dispatcher = Dispatcher::new(journal, script);

    let mut ifaces = Vec::new();
    if !cli.no_activate {
        for name in &cli.interfaces {
            let mut iface = Iface::probe(name)?;
            iface.requested = true;
            ifaces.push(iface);
        }
    }
    if ifaces.is_empty() {
        // No broadcast interfaces: tell the script, then give up.
        let env = ScriptEnv::new(ScriptReason::Nbi, "", None, None);
        ExecScript::new(cli.script.to_string_lossy().as_ref())
            .run(&env)
            .ok();
        if cli.no_activate {
            return Ok(0);
        }
        return Err(DhcpError::new(
            ErrorKind::Fatal,
            "No broadcast interfaces found - exiting.".to_string(),
        ));
    }

    // Form the default DUID from the first hardware address when the
    // database does not carry one yet.
    if dispatcher.journal().duid().is_none() {
        let duid = Duid::new_llt(&ifaces[0].hw);
        if let Some(duid_file) = cli.duid_file.as_deref() {
            write_duid_file(duid_file, &duid)?;
        }
        dispatcher.journal().set_duid(duid);
    }

    for iface in ifaces {
        let mut config = ClientConfig::new();
        config.set_onetry(cli.onetry);
        config.set_script_path(cli.script.to_string_lossy().as_ref());
        dispatcher.add_client(iface, config)?;
    }

    install_signal_handlers()?;

    if cli.release {
        dispatcher.release_leases()?;
        dispatcher.journal().rewrite()?;
        return Ok(0);
    }

    let daemon = if cli.foreground {
        None
    } else {
        Some(DaemonPipe::fork()?)
    };
    if cli.nowait {
        if let Some(daemon) = daemon.as_ref() {
            daemon.complete(0);
        }
    }

    dispatcher.start()?;

    // Timers are scheduled and sockets bound; the parent may go.
    if !cli.nowait {
        if let Some(daemon) = daemon.as_ref() {
            daemon.complete(0);
        }
    }
    if !cli.no_pid {
        write_pid_file(cli.pid_file.as_path());
    }

    dispatcher.run()
}

fn signal_running_instance(pid_file: &Path) -> Result<i32, DhcpError> {
    let content = std::fs::read_to_string(pid_file).map_err(|e| {
        DhcpError::new(
            ErrorKind::InvalidArgument,
            format!("Failed to read PID file {}: {e}", pid_file.display()),
        )
    })?;
    let pid: i32 = content.trim().parse().map_err(|e| {
        DhcpError::new(
            ErrorKind::InvalidArgument,
            format!("Invalid PID file {}: {e}", pid_file.display()),
        )
    })?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .map_err(|e| {
        DhcpError::new(
            ErrorKind::Bug,
            format!("Failed to signal process {pid}: {e}"),
        )
    })?;
    Ok(0)
}

fn write_pid_file(path: &Path) {
    match std::fs::File::create(path) {
        Ok(mut fd) => {
            if let Err(e) = writeln!(fd, "{}", std::process::id()) {
                log::error!(
                    "Failed to write PID file {}: {e}",
                    path.display()
                );
            }
        }
        Err(e) => {
            log::error!("Failed to create PID file {}: {e}", path.display())
        }
    }
}

fn write_duid_file(path: &Path, duid: &Duid) -> Result<(), DhcpError> {
    let mut fd = std::fs::File::create(path)?;
    writeln!(fd, "default-duid {};", duid.to_hex())?;
    Ok(())
}

/// Startup handshake with the forking parent: the parent exits with
/// whatever byte the child writes once it either bound an address or
/// scheduled its timers, so the shell observes startup failures.
struct DaemonPipe {
    write_fd: RawFd,
}

impl DaemonPipe {
    fn fork() -> Result<Self, DhcpError> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| {
            DhcpError::new(ErrorKind::Fatal, format!("pipe() failed: {e}"))
        })?;
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { .. }) => {
                let _ = nix::unistd::close(write_fd);
                let mut buf = [1u8; 1];
                let code = match nix::unistd::read(read_fd, &mut buf) {
                    Ok(1) => i32::from(buf[0]),
                    // The child died before reporting.
                    _ => 1,
                };
                std::process::exit(code);
            }
            Ok(nix::unistd::ForkResult::Child) => {
                let _ = nix::unistd::close(read_fd);
                let _ = nix::unistd::setsid();
                Ok(Self { write_fd })
            }
            Err(e) => Err(DhcpError::new(
                ErrorKind::Fatal,
                format!("fork() failed: {e}"),
            )),
        }
    }

    fn complete(&self, code: u8) {
        let _ = nix::unistd::write(self.write_fd, &[code]);
        let _ = nix::unistd::close(self.write_fd);
    }
}
