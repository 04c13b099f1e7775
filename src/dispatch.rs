// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};

use nix::poll::{poll, PollFd, PollFlags};

use crate::{
    client::{ClientConfig, ClientCtx, Dhcp4Client, TimerToken},
    dhcpv4::Dhcp4Packet,
    iface::Iface,
    journal::LeaseJournal,
    net::NetTransport,
    script::{ScriptEnv, ScriptReason, ScriptRunner},
    time::{now_usec, USEC_PER_SEC},
    timer::TimerWheel,
    DhcpError, ErrorKind,
};

// The signal bridge: handlers may only flip a flag; the loop acts on
// it between waits.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that initiate a clean shutdown.
pub fn install_signal_handlers() -> Result<(), DhcpError> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        // No SA_RESTART: the poll below must wake up on the signal.
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            sigaction(signal, &action).map_err(|e| {
                DhcpError::new(
                    ErrorKind::Fatal,
                    format!("Failed to install {signal} handler: {e}"),
                )
            })?;
        }
    }
    Ok(())
}

/// Single-threaded event loop: wait for socket readability until the
/// nearest timer deadline, deliver received packets, then fire every
/// due timer in deadline order.
pub struct Dispatcher {
    timers: TimerWheel<TimerToken>,
    journal: LeaseJournal,
    script: Box<dyn ScriptRunner>,
    transports: Vec<NetTransport>,
    clients: Vec<Dhcp4Client>,
    client_iface: Vec<usize>,
    exit_at_usec: Option<i64>,
    shutting_down: bool,
}

impl Dispatcher {
    pub fn new(journal: LeaseJournal, script: Box<dyn ScriptRunner>) -> Self {
        Self {
            timers: TimerWheel::new(),
            journal,
            script,
            transports: Vec::new(),
            clients: Vec::new(),
            client_iface: Vec::new(),
            exit_at_usec: None,
            shutting_down: false,
        }
    }

    pub fn journal(&mut self) -> &mut LeaseJournal {
        &mut self.journal
    }

    /// Attach one client to an interface, opening its sockets.
    pub fn add_client(
        &mut self,
        iface: Iface,
        config: ClientConfig,
    ) -> Result<usize, DhcpError> {
        let transport = NetTransport::new(&iface)?;
        let iface_id = self.transports.len();
        self.transports.push(transport);
        let client_id = self.clients.len();
        self.clients
            .push(Dhcp4Client::new(client_id, iface, config));
        self.client_iface.push(iface_id);
        Ok(client_id)
    }

    /// PREINIT the interfaces, then start every client, rebooting with
    /// a remembered lease where the database has a usable one.
    pub fn start(&mut self) -> Result<(), DhcpError> {
        for ci in 0..self.clients.len() {
            let iface_name = self.clients[ci].iface_name().to_string();

            let env = ScriptEnv::new(
                ScriptReason::Preinit,
                iface_name.as_str(),
                None,
                None,
            );
            if let Err(e) = self.script.run(&env) {
                log::error!("PREINIT script failed on {iface_name}: {e}");
            }

            // The most recently committed dynamic lease for this
            // interface is the reboot candidate; earlier ones stay as
            // panic fallbacks inside the client.
            let mut recovered = None;
            for entry in self.journal.entries() {
                if entry.iface == iface_name && !entry.lease.is_static {
                    recovered = Some(entry.lease.clone());
                }
            }

            self.with_client(ci, |client, ctx| {
                client.start(ctx, recovered)
            })?;
        }
        Ok(())
    }

    /// Run the loop. Never returns during normal operation; on
    /// shutdown yields the process exit code.
    pub fn run(&mut self) -> Result<i32, DhcpError> {
        loop {
            if SHUTDOWN.load(Ordering::SeqCst) && !self.shutting_down {
                self.shutting_down = true;
                log::info!("Shutdown requested, releasing leases");
                self.release_all()?;
                // Give the loop one final pass to drain, then exit.
                self.exit_at_usec = Some(now_usec() + 1);
            }

            let now = now_usec();
            if let Some(exit_at) = self.exit_at_usec {
                if now >= exit_at {
                    self.journal.rewrite().ok();
                    return Ok(0);
                }
            }

            let deadline = match (
                self.timers.next_deadline_usec(),
                self.exit_at_usec,
            ) {
                (Some(t), Some(e)) => Some(t.min(e)),
                (Some(t), None) => Some(t),
                (None, e) => e,
            };
            // Wake up at least once a minute even when idle so nothing
            // can wedge the loop forever.
            let timeout_ms = match deadline {
                Some(when) => {
                    ((when - now).max(0) / 1000).min(60_000) as libc::c_int
                }
                None => 60_000,
            };

            let mut fds = Vec::new();
            let mut fd_map = Vec::new();
            for (i, transport) in self.transports.iter().enumerate() {
                fds.push(PollFd::new(transport.raw_fd(), PollFlags::POLLIN));
                fd_map.push((i, true));
                fds.push(PollFd::new(
                    transport.fallback_fd(),
                    PollFlags::POLLIN,
                ));
                fd_map.push((i, false));
            }

            match poll(&mut fds, timeout_ms) {
                Ok(_) => (),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(DhcpError::new(
                        ErrorKind::Bug,
                        format!("poll() failed: {e}"),
                    ));
                }
            }

            let ready: Vec<(usize, bool)> = fds
                .iter()
                .zip(fd_map.iter())
                .filter(|(fd, _)| {
                    fd.revents()
                        .map(|r| r.contains(PollFlags::POLLIN))
                        .unwrap_or(false)
                })
                .map(|(_, m)| *m)
                .collect();
            for (iface_id, is_raw) in ready {
                self.handle_readable(iface_id, is_raw)?;
            }

            // Fire timers only after socket handling, in deadline
            // order.
            let due = self.timers.pop_due(now_usec());
            for token in due {
                if token.client >= self.clients.len() {
                    continue;
                }
                self.with_client(token.client, |client, ctx| {
                    client.handle_timer(ctx, token.event)
                })?;
            }
        }
    }

    fn handle_readable(
        &mut self,
        iface_id: usize,
        is_raw: bool,
    ) -> Result<(), DhcpError> {
        let parsed = if is_raw {
            match self.transports[iface_id].recv_raw() {
                Ok(frame) => match Dhcp4Packet::parse_eth(&frame) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::debug!("Ignoring invalid packet: {e}");
                        return Ok(());
                    }
                },
                Err(e) => {
                    log::debug!("Raw socket recv failed: {e}");
                    return Ok(());
                }
            }
        } else {
            match self.transports[iface_id].recv_fallback() {
                Ok((payload, from)) => match Dhcp4Packet::parse(&payload) {
                    Ok(packet) => (packet, from),
                    Err(e) => {
                        log::debug!("Ignoring invalid packet: {e}");
                        return Ok(());
                    }
                },
                Err(e) => {
                    log::debug!("Fallback socket recv failed: {e}");
                    return Ok(());
                }
            }
        };
        let (packet, from) = parsed;

        // Every client on the interface sees the packet; each one
        // validates the transaction id and hardware address itself.
        for ci in 0..self.clients.len() {
            if self.client_iface[ci] != iface_id {
                continue;
            }
            self.with_client(ci, |client, ctx| {
                client.handle_packet(ctx, &packet, from)
            })?;
        }
        Ok(())
    }

    /// Release every client that holds a lease. Used at shutdown.
    pub fn release_all(&mut self) -> Result<(), DhcpError> {
        for ci in 0..self.clients.len() {
            self.with_client(ci, |client, ctx| client.do_release(ctx))?;
        }
        Ok(())
    }

    /// One-shot release mode: adopt each interface's remembered lease
    /// and send the release without entering the protocol.
    pub fn release_leases(&mut self) -> Result<(), DhcpError> {
        for ci in 0..self.clients.len() {
            let iface_name = self.clients[ci].iface_name().to_string();
            let mut recovered = None;
            for entry in self.journal.entries() {
                if entry.iface == iface_name && !entry.lease.is_static {
                    recovered = Some(entry.lease.clone());
                }
            }
            if let Some(lease) = recovered {
                self.clients[ci].adopt_lease(lease);
            }
            self.with_client(ci, |client, ctx| client.do_release(ctx))?;
        }
        Ok(())
    }

    fn with_client<F>(&mut self, ci: usize, f: F) -> Result<(), DhcpError>
    where
        F: FnOnce(
            &mut Dhcp4Client,
            &mut ClientCtx<'_>,
        ) -> Result<(), DhcpError>,
    {
        let iface_id = self.client_iface[ci];
        let now = now_usec();
        let client = &mut self.clients[ci];
        let mut ctx = ClientCtx {
            now: now / USEC_PER_SEC,
            now_usec: now,
            timers: &mut self.timers,
            transport: &mut self.transports[iface_id],
            script: self.script.as_ref(),
            journal: &mut self.journal,
        };
        f(client, &mut ctx)
    }
}
