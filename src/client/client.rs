// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use rand::Rng;

use super::{config::ClientConfig, lease::ClientLease, state::ClientState};
use crate::{
    dhcpv4::options::{
        OptionValue, Universe, DHO_CLIENT_IDENTIFIER, DHO_HOST_NAME,
        DHO_MESSAGE_TYPE, DHO_PARAMETER_REQUEST_LIST, DHO_REQUESTED_ADDRESS,
        DHO_SERVER_IDENTIFIER,
    },
    dhcpv4::packet::{BOOTP_BROADCAST, BOOTREPLY},
    dhcpv4::{Dhcp4MessageType, Dhcp4Packet},
    iface::Iface,
    journal::LeaseJournal,
    net::Transport,
    script::{ScriptEnv, ScriptReason, ScriptRunner},
    time::USEC_PER_SEC,
    timer::{TimerHandle, TimerWheel},
    DhcpError, ErrorKind,
};

/// Damping between journal writes for the same client; the journal is
/// still guaranteed current within this many seconds of a commit.
const MIN_LEASE_WRITE: i64 = 15;

/// Restart delay after rejecting a zero-lease-time ACK.
const ZERO_LEASE_RETRY_USEC: i64 = 500_000;

/// Timers a client schedules, delivered back through
/// [Dhcp4Client::handle_timer].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TimerEvent {
    SendDiscover,
    StateSelecting,
    SendRequest,
    StateBound,
    StateInit,
}

/// Timer token carried through the wheel: which client, which event.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimerToken {
    pub client: usize,
    pub event: TimerEvent,
}

/// Everything a handler may touch besides the client itself. The
/// dispatcher re-reads the clock before constructing one.
pub struct ClientCtx<'a> {
    pub now: i64,
    pub now_usec: i64,
    pub timers: &'a mut TimerWheel<TimerToken>,
    pub transport: &'a mut dyn Transport,
    pub script: &'a dyn ScriptRunner,
    pub journal: &'a mut LeaseJournal,
}

#[derive(Debug, Default)]
struct ClientTimers {
    send_discover: Option<TimerHandle>,
    state_selecting: Option<TimerHandle>,
    send_request: Option<TimerHandle>,
    state_bound: Option<TimerHandle>,
    state_init: Option<TimerHandle>,
}

/// One DHCPv4 protocol instance on an interface.
#[derive(Debug)]
pub struct Dhcp4Client {
    id: usize,
    iface: Iface,
    config: ClientConfig,
    state: ClientState,
    xid: u32,
    destination: Ipv4Addr,
    first_sending: i64,
    interval: i64,
    secs: u16,
    medium_idx: Option<usize>,
    requested_address: Option<Ipv4Addr>,
    /// Stored fallback leases; the head is tried first in panic mode.
    leases: Vec<ClientLease>,
    sent_packet: Option<Dhcp4Packet>,
    last_write: i64,
    timers: ClientTimers,
}

impl Dhcp4Client {
    pub fn new(id: usize, iface: Iface, config: ClientConfig) -> Self {
        let requested_address = config.requested_address;
        let mut leases = Vec::new();
        for lease in &config.static_leases {
            leases.push(lease.clone());
        }
        Self {
            id,
            iface,
            config,
            state: ClientState::Init,
            xid: 0,
            destination: Ipv4Addr::BROADCAST,
            first_sending: 0,
            interval: 0,
            secs: 0,
            medium_idx: None,
            requested_address,
            leases,
            sent_packet: None,
            last_write: 0,
            timers: ClientTimers::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn iface_name(&self) -> &str {
        self.iface.name.as_str()
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn client_name(&self) -> Option<&str> {
        self.config.client_name.as_deref()
    }

    fn medium(&self) -> Option<&str> {
        self.medium_idx
            .and_then(|i| self.config.media.get(i))
            .map(|s| s.as_str())
    }

    /// Start the protocol: reboot with a remembered lease when it is
    /// still usable, otherwise discover from scratch.
    pub fn start(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        recovered: Option<ClientLease>,
    ) -> Result<(), DhcpError> {
        if let Some(lease) = recovered {
            if !lease.is_bootp && lease.expiry > ctx.now {
                return self.state_reboot(ctx, lease);
            }
            self.store_lease(lease);
        }
        self.state_init(ctx)
    }

    // ------------------------------------------------------------------
    // Timer and packet entry points
    // ------------------------------------------------------------------

    pub fn handle_timer(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        event: TimerEvent,
    ) -> Result<(), DhcpError> {
        log::debug!(
            "Timer {event:?} fired on {} in state {}",
            self.iface.name,
            self.state
        );
        match event {
            TimerEvent::SendDiscover => {
                self.timers.send_discover = None;
                self.send_discover(ctx)
            }
            TimerEvent::StateSelecting => {
                self.timers.state_selecting = None;
                self.state_selecting(ctx)
            }
            TimerEvent::SendRequest => {
                self.timers.send_request = None;
                self.send_request(ctx)
            }
            TimerEvent::StateBound => {
                self.timers.state_bound = None;
                self.state_bound(ctx)
            }
            TimerEvent::StateInit => {
                self.timers.state_init = None;
                self.state_init(ctx)
            }
        }
    }

    pub fn handle_packet(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        packet: &Dhcp4Packet,
        from: Ipv4Addr,
    ) -> Result<(), DhcpError> {
        if packet.op != BOOTREPLY {
            return Ok(());
        }
        if packet.xid != self.xid {
            log::debug!(
                "Dropping packet in wrong transaction: expecting xid {:x}, \
                 got {:x}",
                self.xid,
                packet.xid
            );
            return Ok(());
        }
        let hlen = usize::from(packet.hlen);
        if hlen != self.iface.hw.bytes.len()
            || packet.chaddr[..hlen] != self.iface.hw.bytes[..]
        {
            log::debug!("Dropping packet with foreign chaddr");
            return Ok(());
        }
        if self.config.is_rejected(from) {
            log::info!("Ignoring packet from rejected server {from}");
            return Ok(());
        }
        match Dhcp4MessageType::try_from(packet.packet_type()) {
            Ok(Dhcp4MessageType::Offer) => self.dhcpoffer(ctx, packet, from),
            Ok(Dhcp4MessageType::Ack) => self.dhcpack(ctx, packet, from),
            Ok(Dhcp4MessageType::Nak) => self.dhcpnak(ctx, packet, from),
            // A BOOTREPLY without DHCP options is a BOOTP offer.
            Err(_) if packet.packet_type() == 0 => {
                self.dhcpoffer(ctx, packet, from)
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // INIT / SELECTING
    // ------------------------------------------------------------------

    /// Enter INIT: build a fresh DHCPDISCOVER and send it immediately.
    /// A lease still carried by the outgoing state is kept as a panic
    /// fallback rather than silently lost.
    fn state_init(&mut self, ctx: &mut ClientCtx<'_>) -> Result<(), DhcpError> {
        match std::mem::take(&mut self.state) {
            ClientState::Bound { lease }
            | ClientState::Renewing { lease }
            | ClientState::Rebinding { lease }
            | ClientState::Rebooting { lease } => self.store_lease(lease),
            _ => (),
        }
        self.xid = rand::thread_rng().gen();
        self.make_discover();
        self.destination = Ipv4Addr::BROADCAST;
        self.state = ClientState::Selecting {
            offered: Vec::new(),
        };
        self.first_sending = ctx.now;
        self.interval = self.config.initial_interval;
        self.send_discover(ctx)
    }

    fn send_discover(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        let elapsed = ctx.now - self.first_sending;
        if elapsed > self.config.timeout {
            return self.state_panic(ctx);
        }

        let offered_empty = match &self.state {
            ClientState::Selecting { offered } => offered.is_empty(),
            _ => true,
        };
        let mut increase = true;
        if offered_empty && !self.config.media.is_empty() {
            increase = self.next_medium(ctx)?;
        }

        // Exponential backoff: on average the interval doubles with
        // every transmission, bounded by the cutoff.
        let mut rng = rand::thread_rng();
        if increase {
            if self.interval == 0 {
                self.interval = self.config.initial_interval;
            } else {
                self.interval += rng.gen_range(0..2 * self.interval);
            }
            if self.interval > self.config.backoff_cutoff {
                self.interval = self.config.backoff_cutoff / 2
                    + rng.gen_range(0..self.config.backoff_cutoff);
            }
        } else if self.interval == 0 {
            self.interval = self.config.initial_interval;
        }

        // Land the next retransmit exactly on the panic deadline rather
        // than overshooting it.
        if ctx.now + self.interval
            > self.first_sending + self.config.timeout
        {
            self.interval =
                self.first_sending + self.config.timeout - ctx.now + 1;
        }

        self.secs = elapsed.clamp(0, i64::from(u16::MAX)) as u16;
        if let Some(packet) = self.sent_packet.as_mut() {
            packet.secs = self.secs;
            log::info!(
                "DHCPDISCOVER on {} to {} port 67 interval {}",
                self.iface.name,
                Ipv4Addr::BROADCAST,
                self.interval
            );
            match packet.to_eth_broadcast() {
                Ok(frame) => {
                    if let Err(e) = ctx.transport.send_broadcast(&frame) {
                        log::error!("Failed to send DHCPDISCOVER: {e}");
                    }
                }
                Err(e) => log::error!("{e}"),
            }
        }

        let when = ctx.now_usec
            + self.interval * USEC_PER_SEC
            + jitter_usec(self.interval);
        self.replace_timer(ctx, TimerEvent::SendDiscover, when);
        Ok(())
    }

    /// Advance the media cursor and let the script switch the
    /// transport. Returns whether the backoff interval should grow on
    /// this round. Exhausting the whole list without one working
    /// medium is fatal.
    fn next_medium(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<bool, DhcpError> {
        let mut fail = false;
        let mut increase = true;
        loop {
            if let Some(i) = self.medium_idx {
                self.medium_idx = if i + 1 < self.config.media.len() {
                    Some(i + 1)
                } else {
                    None
                };
                increase = false;
            }
            if self.medium_idx.is_none() {
                if fail {
                    let e = DhcpError::new(
                        ErrorKind::Fatal,
                        format!(
                            "No valid media types for {}",
                            self.iface.name
                        ),
                    );
                    log::error!("{e}");
                    return Err(e);
                }
                self.medium_idx = Some(0);
                increase = true;
            }
            let medium = self.medium().unwrap_or_default().to_string();
            log::info!("Trying medium \"{medium}\"");
            let env = ScriptEnv::new(
                ScriptReason::Medium,
                self.iface.name.as_str(),
                self.client_name(),
                Some(medium.as_str()),
            );
            match ctx.script.run(&env) {
                Ok(0) => return Ok(increase),
                Ok(_) => fail = true,
                Err(e) => {
                    log::error!("MEDIUM script failed: {e}");
                    fail = true;
                }
            }
        }
    }

    fn dhcpoffer(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        packet: &Dhcp4Packet,
        from: Ipv4Addr,
    ) -> Result<(), DhcpError> {
        let name = if packet.packet_type() == 0 {
            "BOOTREPLY"
        } else {
            "DHCPOFFER"
        };
        if !matches!(self.state, ClientState::Selecting { .. }) {
            log::debug!("{name} in wrong state {}", self.state);
            return Ok(());
        }

        // Ignore offers that lack required parameters.
        for code in &self.config.required_options {
            if !packet.options.contains_dhcp(*code) {
                log::info!(
                    "{} of {} from {}: no {} option.",
                    name,
                    packet.yiaddr,
                    from,
                    crate::dhcpv4::options::option_name(*code)
                );
                return Ok(());
            }
        }

        let mut lease = ClientLease::from_packet(packet);
        lease.medium = self.medium().map(|s| s.to_string());

        let stop_selecting =
            self.first_sending + self.config.select_interval;
        let preferred = Some(lease.address) == self.requested_address;

        if let ClientState::Selecting { offered } = &mut self.state {
            if offered.iter().any(|l| l.address == lease.address) {
                log::debug!(
                    "{} of {} from {}: already seen.",
                    name,
                    lease.address,
                    from
                );
                return Ok(());
            }
            log::info!("{} of {} from {}", name, lease.address, from);
            if preferred {
                offered.insert(0, lease);
            } else {
                offered.push(lease);
            }
        }

        if stop_selecting <= ctx.now {
            self.state_selecting(ctx)
        } else {
            self.replace_timer(
                ctx,
                TimerEvent::StateSelecting,
                stop_selecting * USEC_PER_SEC,
            );
            self.cancel_timer(ctx, TimerEvent::SendDiscover);
            Ok(())
        }
    }

    /// Commit the offer selection: first valid offer wins, preferring
    /// one matching a previously requested address (no ARP probing).
    fn state_selecting(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        self.cancel_timer(ctx, TimerEvent::StateSelecting);
        self.cancel_timer(ctx, TimerEvent::SendDiscover);

        let mut offered = match std::mem::take(&mut self.state) {
            ClientState::Selecting { offered } => offered,
            state => {
                self.state = state;
                return Ok(());
            }
        };
        let picked = if offered.is_empty() {
            None
        } else {
            // The rest of the collected offers are consumed here.
            Some(offered.swap_remove(0))
        };

        let mut picked = match picked {
            Some(picked) => picked,
            None => return self.state_init(ctx),
        };

        if picked.is_bootp {
            // A BOOTREPLY binds immediately with synthesized timers.
            picked.set_bootp_times(ctx.now);
            self.state = ClientState::Requesting {
                lease: picked.clone(),
            };
            return self.bind_lease(ctx, picked);
        }

        self.destination = Ipv4Addr::BROADCAST;
        self.first_sending = ctx.now;
        self.interval = self.config.initial_interval;
        self.state = ClientState::Requesting {
            lease: picked.clone(),
        };
        self.make_request(&picked);
        self.send_request(ctx)
    }

    // ------------------------------------------------------------------
    // REQUESTING / REBOOTING / RENEWING / REBINDING
    // ------------------------------------------------------------------

    fn state_reboot(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        lease: ClientLease,
    ) -> Result<(), DhcpError> {
        self.xid = rand::thread_rng().gen();
        self.state = ClientState::Rebooting {
            lease: lease.clone(),
        };
        self.make_request(&lease);
        self.destination = Ipv4Addr::BROADCAST;
        self.first_sending = ctx.now;
        self.interval = self.config.initial_interval;
        self.medium_idx = None;
        self.send_request(ctx)
    }

    fn send_request(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        let elapsed = ctx.now - self.first_sending;

        // Without an ACK by the reboot deadline, fall back to
        // discovery. An old address may have been reusable, but a
        // DISCOVER gets us an address either way.
        if matches!(
            self.state,
            ClientState::Requesting { .. } | ClientState::Rebooting { .. }
        ) && elapsed > self.config.reboot_timeout
        {
            self.cancel_timer(ctx, TimerEvent::SendRequest);
            if let ClientState::Rebooting { lease } =
                std::mem::take(&mut self.state)
            {
                self.store_lease(lease);
            }
            return self.state_init(ctx);
        }

        // Rebooting resumes whatever medium carried the lease before.
        let reboot_medium = match &self.state {
            ClientState::Rebooting { lease } if self.medium_idx.is_none() => {
                lease.medium.clone()
            }
            _ => None,
        };
        if let Some(medium) = reboot_medium {
            let env = ScriptEnv::new(
                ScriptReason::Medium,
                self.iface.name.as_str(),
                self.client_name(),
                Some(medium.as_str()),
            );
            if !matches!(ctx.script.run(&env), Ok(0)) {
                self.cancel_timer(ctx, TimerEvent::SendRequest);
                if let ClientState::Rebooting { lease } =
                    std::mem::take(&mut self.state)
                {
                    self.store_lease(lease);
                }
                return self.state_init(ctx);
            }
            self.medium_idx =
                self.config.media.iter().position(|m| *m == medium);
        }

        // A fully expired lease cannot be renewed; uninstall and start
        // over.
        if let Some(lease) = self.state.active_lease() {
            if ctx.now > lease.expiry {
                let lease = lease.clone();
                self.cancel_timer(ctx, TimerEvent::SendRequest);
                self.run_expire_preinit(ctx, &lease);
                self.state = ClientState::Init;
                self.drop_or_store(lease);
                return self.state_init(ctx);
            }
        }

        let mut rng = rand::thread_rng();
        if self.interval == 0 {
            self.interval = self.config.initial_interval;
        } else {
            self.interval += rng.gen_range(0..2 * self.interval);
        }
        if self.interval > self.config.backoff_cutoff {
            self.interval = self.config.backoff_cutoff / 2
                + rng.gen_range(0..self.config.backoff_cutoff);
        }

        // Past T2 a renewal turns into a rebind: broadcast instead of
        // unicasting to a server that stopped answering.
        if let ClientState::Renewing { lease } = &self.state {
            if ctx.now > lease.rebind {
                let lease = lease.clone();
                log::info!(
                    "T2 expired on {}, rebinding {}",
                    self.iface.name,
                    lease.address
                );
                self.state = ClientState::Rebinding { lease };
            }
        }

        // Never let the backoff sleep past the expiry deadline.
        if let Some(lease) = self.state.active_lease() {
            if ctx.now + self.interval > lease.expiry {
                self.interval = lease.expiry - ctx.now + 1;
            }
        }

        let broadcast = matches!(
            self.state,
            ClientState::Requesting { .. }
                | ClientState::Rebooting { .. }
                | ClientState::Rebinding { .. }
        );
        let destination = if broadcast {
            Ipv4Addr::BROADCAST
        } else {
            self.destination
        };
        let from = match self.state.active_lease() {
            Some(lease) => lease.address,
            None => Ipv4Addr::UNSPECIFIED,
        };

        // The secs field is frozen during REQUESTING so the server
        // sees the age of the whole exchange, not of this state.
        let secs = if matches!(self.state, ClientState::Requesting { .. }) {
            self.secs
        } else {
            elapsed.clamp(0, i64::from(u16::MAX)) as u16
        };

        let request_ip = match &self.state {
            ClientState::Requesting { lease }
            | ClientState::Rebooting { lease } => lease.address,
            _ => from,
        };
        log::info!(
            "DHCPREQUEST for {} on {} to {} port 67",
            request_ip,
            self.iface.name,
            destination
        );

        if let Some(packet) = self.sent_packet.as_mut() {
            packet.secs = secs;
            if destination == Ipv4Addr::BROADCAST {
                match packet.to_eth_broadcast() {
                    Ok(frame) => {
                        if let Err(e) = ctx.transport.send_broadcast(&frame)
                        {
                            log::error!("Failed to send DHCPREQUEST: {e}");
                        }
                    }
                    Err(e) => log::error!("{e}"),
                }
            } else if let Err(e) = ctx.transport.send_unicast(
                from,
                destination,
                &packet.emit(),
            ) {
                log::error!("Failed to send DHCPREQUEST: {e}");
            }
        }

        let when = ctx.now_usec
            + self.interval * USEC_PER_SEC
            + jitter_usec(self.interval);
        self.replace_timer(ctx, TimerEvent::SendRequest, when);
        Ok(())
    }

    fn dhcpack(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        packet: &Dhcp4Packet,
        from: Ipv4Addr,
    ) -> Result<(), DhcpError> {
        if !self.state.expects_ack() {
            log::debug!("DHCPACK in wrong state {}", self.state);
            return Ok(());
        }
        log::info!("DHCPACK of {} from {}", packet.yiaddr, from);

        let mut lease = ClientLease::from_packet(packet);
        self.cancel_timer(ctx, TimerEvent::SendRequest);

        if let Err(e) = lease.compute_times(ctx.now) {
            log::error!("{}", e.msg());
            // Quench this server and return to INIT to reselect.
            self.config
                .add_reject(from, Ipv4Addr::new(255, 255, 255, 255));
            log::info!("Server added to list of rejected servers.");
            self.replace_timer(
                ctx,
                TimerEvent::StateInit,
                ctx.now_usec + ZERO_LEASE_RETRY_USEC,
            );
            return Ok(());
        }

        self.bind_lease(ctx, lease)
    }

    fn dhcpnak(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        _packet: &Dhcp4Packet,
        from: Ipv4Addr,
    ) -> Result<(), DhcpError> {
        if !self.state.expects_ack() {
            log::debug!("DHCPNAK in wrong state {}", self.state);
            return Ok(());
        }
        log::info!("DHCPNAK from {from}");
        self.cancel_timer(ctx, TimerEvent::SendRequest);

        match std::mem::take(&mut self.state) {
            // The server refused the remembered or installed address:
            // expire all old bindings, bring the interface back up, and
            // rediscover.
            ClientState::Rebooting { lease }
            | ClientState::Renewing { lease }
            | ClientState::Rebinding { lease } => {
                self.run_expire_preinit(ctx, &lease);
                self.drop_or_store(lease);
            }
            // During the first exchange there is nothing installed yet.
            _ => (),
        }
        self.state = ClientState::Init;
        self.state_init(ctx)
    }

    /// EXPIRE tears the address down; PREINIT brings the interface
    /// back into a state where a fresh DISCOVER can go out.
    fn run_expire_preinit(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        lease: &ClientLease,
    ) {
        let mut env = ScriptEnv::new(
            ScriptReason::Expire,
            self.iface.name.as_str(),
            self.client_name(),
            None,
        );
        env.write_params("old_", lease);
        env.write_requested(&self.config.requested_options);
        if let Err(e) = ctx.script.run(&env) {
            log::error!("EXPIRE script failed: {e}");
        }

        let env = ScriptEnv::new(
            ScriptReason::Preinit,
            self.iface.name.as_str(),
            self.client_name(),
            None,
        );
        if let Err(e) = ctx.script.run(&env) {
            log::error!("PREINIT script failed: {e}");
        }
    }

    // ------------------------------------------------------------------
    // BOUND and lease installation
    // ------------------------------------------------------------------

    /// Install a freshly acknowledged lease: run the script, persist
    /// the lease, replace the old binding, and arm the T1 timer.
    fn bind_lease(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        mut new: ClientLease,
    ) -> Result<(), DhcpError> {
        new.medium = self
            .medium()
            .map(|s| s.to_string())
            .or_else(|| new.medium.take());

        let reason = match &self.state {
            ClientState::Requesting { .. } => ScriptReason::Bound,
            ClientState::Renewing { .. } => ScriptReason::Renew,
            ClientState::Rebooting { .. } => ScriptReason::Reboot,
            _ => ScriptReason::Rebind,
        };
        let mut env = ScriptEnv::new(
            reason,
            self.iface.name.as_str(),
            self.client_name(),
            new.medium.as_deref(),
        );
        if let Some(old) = self.state.active_lease() {
            env.write_params("old_", old);
        }
        env.write_params("new_", &new);
        env.write_requested(&self.config.requested_options);

        // A nonzero exit from BOUND/RENEW means the script detected
        // another host using the offered address.
        let status = ctx.script.run(&env).unwrap_or(0);
        if status != 0 {
            return self.decline_lease(ctx, new);
        }

        if self.last_write == 0
            || ctx.now - self.last_write >= MIN_LEASE_WRITE
        {
            if let Err(e) = ctx.journal.write_lease(
                self.iface.name.as_str(),
                self.client_name(),
                &new,
                false,
            ) {
                // In-memory state is authoritative; the next rewrite
                // may succeed.
                log::error!("Failed to write lease database: {e}");
            } else {
                self.last_write = ctx.now;
            }
        }

        // Replace the old binding. Static fallback leases survive at
        // the tail of the stored list; dynamic ones are done.
        match std::mem::take(&mut self.state) {
            ClientState::Bound { lease }
            | ClientState::Renewing { lease }
            | ClientState::Rebinding { lease }
            | ClientState::Rebooting { lease } => self.drop_or_store(lease),
            _ => (),
        }

        log::info!(
            "bound to {} -- renewal in {} seconds.",
            new.address,
            new.renewal - ctx.now
        );
        let renewal = new.renewal;
        self.state = ClientState::Bound { lease: new };
        let when = renewal.saturating_mul(USEC_PER_SEC).saturating_add(
            if renewal - ctx.now > 1 {
                rand::thread_rng().gen_range(0..USEC_PER_SEC)
            } else {
                0
            },
        );
        self.replace_timer(ctx, TimerEvent::StateBound, when);
        Ok(())
    }

    /// The offered address is in use elsewhere: decline it, then
    /// restart discovery after a quarantine delay.
    fn decline_lease(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        lease: ClientLease,
    ) -> Result<(), DhcpError> {
        self.make_decline(&lease);
        log::info!(
            "DHCPDECLINE of {} on {} to {} port 67",
            lease.address,
            self.iface.name,
            Ipv4Addr::BROADCAST
        );
        if let Some(packet) = self.sent_packet.as_ref() {
            match packet.to_eth_broadcast() {
                Ok(frame) => {
                    if let Err(e) = ctx.transport.send_broadcast(&frame) {
                        log::error!("Failed to send DHCPDECLINE: {e}");
                    }
                }
                Err(e) => log::error!("{e}"),
            }
        }

        if self.config.onetry {
            let e = DhcpError::new(
                ErrorKind::NoLease,
                "Unable to obtain a lease on first try (declined). \
                 Exiting."
                    .to_string(),
            );
            log::info!("{}", e.msg());
            return Err(e);
        }

        self.state = ClientState::Declining;
        self.replace_timer(
            ctx,
            TimerEvent::StateInit,
            ctx.now_usec + self.config.decline_wait * USEC_PER_SEC,
        );
        Ok(())
    }

    /// T1 fired: unicast a renewal request to the leasing server.
    fn state_bound(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        let lease = match std::mem::take(&mut self.state) {
            ClientState::Bound { lease } => lease,
            state => {
                self.state = state;
                return Ok(());
            }
        };

        self.destination = lease.server_id().unwrap_or(Ipv4Addr::BROADCAST);
        self.first_sending = ctx.now;
        self.interval = self.config.initial_interval;
        self.state = ClientState::Renewing {
            lease: lease.clone(),
        };
        self.make_request(&lease);
        self.send_request(ctx)
    }

    // ------------------------------------------------------------------
    // Panic mode
    // ------------------------------------------------------------------

    /// The global timeout passed without an acceptable offer. Try the
    /// stored leases; failing that, sleep and rediscover later.
    fn state_panic(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        log::info!("No DHCPOFFERS received.");

        for _ in 0..self.leases.len() {
            let lease = self.leases.remove(0);
            if lease.expiry > ctx.now {
                log::info!(
                    "Trying {} lease {}",
                    if lease.is_static {
                        "fallback"
                    } else {
                        "recorded"
                    },
                    lease.address
                );
                let mut env = ScriptEnv::new(
                    ScriptReason::Timeout,
                    self.iface.name.as_str(),
                    self.client_name(),
                    lease.medium.as_deref(),
                );
                env.write_params("new_", &lease);
                env.write_requested(&self.config.requested_options);
                if matches!(ctx.script.run(&env), Ok(0)) {
                    self.cancel_timer(ctx, TimerEvent::SendDiscover);
                    self.cancel_timer(ctx, TimerEvent::StateSelecting);
                    if ctx.now < lease.renewal {
                        log::info!(
                            "bound: renewal in {} seconds.",
                            lease.renewal - ctx.now
                        );
                        let renewal = lease.renewal;
                        self.state = ClientState::Bound { lease };
                        let when = renewal
                            .saturating_mul(USEC_PER_SEC)
                            .saturating_add(if renewal - ctx.now > 1 {
                                rand::thread_rng()
                                    .gen_range(0..USEC_PER_SEC)
                            } else {
                                0
                            });
                        self.replace_timer(
                            ctx,
                            TimerEvent::StateBound,
                            when,
                        );
                    } else {
                        log::info!("bound: immediate renewal.");
                        self.state = ClientState::Bound { lease };
                        self.state_bound(ctx)?;
                    }
                    return Ok(());
                }
            }
            self.leases.push(lease);
        }

        if self.config.onetry {
            let e = DhcpError::new(
                ErrorKind::NoLease,
                "Unable to obtain a lease on first try.  Exiting."
                    .to_string(),
            );
            log::info!("{}", e.msg());
            return Err(e);
        }

        log::info!("No working leases in persistent database - sleeping.");
        let env = ScriptEnv::new(
            ScriptReason::Fail,
            self.iface.name.as_str(),
            self.client_name(),
            None,
        );
        if let Err(e) = ctx.script.run(&env) {
            log::error!("FAIL script failed: {e}");
        }

        self.state = ClientState::Init;
        let mut rng = rand::thread_rng();
        let delay = (self.config.retry_interval + 1) / 2
            + rng.gen_range(0..self.config.retry_interval);
        let when =
            ctx.now_usec + delay * USEC_PER_SEC + jitter_usec(delay);
        self.replace_timer(ctx, TimerEvent::StateInit, when);
        Ok(())
    }

    // ------------------------------------------------------------------
    // RELEASE / STOP
    // ------------------------------------------------------------------

    /// Adopt a recovered lease as the installed binding without
    /// driving the protocol; the one-shot release mode uses this to
    /// release what the database remembers.
    pub(crate) fn adopt_lease(&mut self, lease: ClientLease) {
        self.state = ClientState::Bound { lease };
    }

    /// Release the active lease back to the server and stop operating.
    pub fn do_release(
        &mut self,
        ctx: &mut ClientCtx<'_>,
    ) -> Result<(), DhcpError> {
        self.xid = rand::thread_rng().gen();

        if let Some(lease) = self.state.active_lease().cloned() {
            self.make_release(&lease);
            self.destination =
                lease.server_id().unwrap_or(Ipv4Addr::BROADCAST);
            self.first_sending = ctx.now;
            self.interval = self.config.initial_interval;
            self.medium_idx = None;

            log::info!(
                "DHCPRELEASE of {} on {} to {} port 67",
                lease.address,
                self.iface.name,
                self.destination
            );
            if let Some(packet) = self.sent_packet.as_ref() {
                if self.destination == Ipv4Addr::BROADCAST {
                    match packet.to_eth_broadcast() {
                        Ok(frame) => {
                            if let Err(e) =
                                ctx.transport.send_broadcast(&frame)
                            {
                                log::error!(
                                    "Failed to send DHCPRELEASE: {e}"
                                );
                            }
                        }
                        Err(e) => log::error!("{e}"),
                    }
                } else if let Err(e) = ctx.transport.send_unicast(
                    lease.address,
                    self.destination,
                    &packet.emit(),
                ) {
                    log::error!("Failed to send DHCPRELEASE: {e}");
                }
            }

            // The released binding goes to the database with its
            // lifetime over, forced to stable storage.
            let mut dead = lease.clone();
            dead.expiry = ctx.now;
            dead.renewal = ctx.now;
            dead.rebind = ctx.now;
            if let Err(e) = ctx.journal.write_lease(
                self.iface.name.as_str(),
                self.client_name(),
                &dead,
                true,
            ) {
                log::error!("Failed to write lease database: {e}");
            }

            let mut env = ScriptEnv::new(
                ScriptReason::Release,
                self.iface.name.as_str(),
                self.client_name(),
                None,
            );
            env.write_params("old_", &lease);
            env.write_requested(&self.config.requested_options);
            if let Err(e) = ctx.script.run(&env) {
                log::error!("RELEASE script failed: {e}");
            }
        }

        self.cancel_all_timers(ctx);
        self.state = ClientState::Stopped;
        Ok(())
    }

    /// Stop operating without releasing: cancel timers and let the
    /// script tear the address down.
    pub fn stop(&mut self, ctx: &mut ClientCtx<'_>) {
        self.cancel_all_timers(ctx);
        if let Some(lease) = self.state.active_lease().cloned() {
            let mut env = ScriptEnv::new(
                ScriptReason::Stop,
                self.iface.name.as_str(),
                self.client_name(),
                lease.medium.as_deref(),
            );
            env.write_params("old_", &lease);
            env.write_requested(&self.config.requested_options);
            if let Err(e) = ctx.script.run(&env) {
                log::error!("STOP script failed: {e}");
            }
        }
        self.state = ClientState::Stopped;
    }

    // ------------------------------------------------------------------
    // Packet construction
    // ------------------------------------------------------------------

    fn base_packet(&self) -> Dhcp4Packet {
        let mut packet = Dhcp4Packet {
            htype: self.iface.hw.htype,
            hlen: self.iface.hw.bytes.len() as u8,
            xid: self.xid,
            ..Default::default()
        };
        packet.chaddr[..self.iface.hw.bytes.len()]
            .copy_from_slice(&self.iface.hw.bytes);
        if !self.config.can_receive_unicast {
            packet.flags = BOOTP_BROADCAST;
        }
        if let Some(host_name) = self.config.host_name.as_ref() {
            packet.options.save(
                Universe::Dhcp,
                DHO_HOST_NAME,
                OptionValue::Raw(host_name.as_bytes().to_vec()),
            );
        }
        if let Some(client_id) = self.config.client_id.as_ref() {
            packet.options.save(
                Universe::Dhcp,
                DHO_CLIENT_IDENTIFIER,
                OptionValue::Raw(client_id.clone()),
            );
        }
        packet
    }

    fn save_type(packet: &mut Dhcp4Packet, t: Dhcp4MessageType) {
        packet.options.save(
            Universe::Dhcp,
            DHO_MESSAGE_TYPE,
            OptionValue::Raw(vec![t as u8]),
        );
    }

    fn save_prl(&self, packet: &mut Dhcp4Packet) {
        if !self.config.requested_options.is_empty() {
            packet.options.save(
                Universe::Dhcp,
                DHO_PARAMETER_REQUEST_LIST,
                OptionValue::Raw(self.config.requested_options.clone()),
            );
        }
    }

    fn make_discover(&mut self) {
        let mut packet = self.base_packet();
        Self::save_type(&mut packet, Dhcp4MessageType::Discover);
        self.save_prl(&mut packet);
        if let Some(addr) = self.requested_address {
            packet.options.save(
                Universe::Dhcp,
                DHO_REQUESTED_ADDRESS,
                OptionValue::Raw(addr.octets().to_vec()),
            );
        }
        self.sent_packet = Some(packet);
    }

    fn make_request(&mut self, lease: &ClientLease) {
        let mut packet = self.base_packet();
        Self::save_type(&mut packet, Dhcp4MessageType::Request);
        self.save_prl(&mut packet);

        match &self.state {
            ClientState::Requesting { .. } => {
                if let Some(server_id) = lease.server_id() {
                    packet.options.save(
                        Universe::Dhcp,
                        DHO_SERVER_IDENTIFIER,
                        OptionValue::Raw(server_id.octets().to_vec()),
                    );
                }
                packet.options.save(
                    Universe::Dhcp,
                    DHO_REQUESTED_ADDRESS,
                    OptionValue::Raw(lease.address.octets().to_vec()),
                );
            }
            ClientState::Rebooting { .. } => {
                packet.options.save(
                    Universe::Dhcp,
                    DHO_REQUESTED_ADDRESS,
                    OptionValue::Raw(lease.address.octets().to_vec()),
                );
            }
            // Extending an installed lease identifies the binding via
            // ciaddr instead.
            _ => {
                packet.ciaddr = lease.address;
                packet.flags = 0;
            }
        }
        self.requested_address = Some(lease.address);
        self.sent_packet = Some(packet);
    }

    fn make_decline(&mut self, lease: &ClientLease) {
        let mut packet = self.base_packet();
        Self::save_type(&mut packet, Dhcp4MessageType::Decline);
        if let Some(server_id) = lease.server_id() {
            packet.options.save(
                Universe::Dhcp,
                DHO_SERVER_IDENTIFIER,
                OptionValue::Raw(server_id.octets().to_vec()),
            );
        }
        packet.options.save(
            Universe::Dhcp,
            DHO_REQUESTED_ADDRESS,
            OptionValue::Raw(lease.address.octets().to_vec()),
        );
        self.requested_address = Some(lease.address);
        self.sent_packet = Some(packet);
    }

    fn make_release(&mut self, lease: &ClientLease) {
        let mut packet = self.base_packet();
        Self::save_type(&mut packet, Dhcp4MessageType::Release);
        if let Some(server_id) = lease.server_id() {
            packet.options.save(
                Universe::Dhcp,
                DHO_SERVER_IDENTIFIER,
                OptionValue::Raw(server_id.octets().to_vec()),
            );
        }
        packet.ciaddr = lease.address;
        packet.flags = 0;
        self.sent_packet = Some(packet);
    }

    // ------------------------------------------------------------------
    // Lease list and timer bookkeeping
    // ------------------------------------------------------------------

    /// Keep a lease for later fallback, replacing any stored lease of
    /// the same address and origin so each (address, is_static) pair
    /// appears once.
    fn store_lease(&mut self, lease: ClientLease) {
        self.leases.retain(|l| {
            l.address != lease.address || l.is_static != lease.is_static
        });
        self.leases.push(lease);
    }

    /// Routine replacement: dynamic leases are finished, fallback
    /// leases survive at the tail of the stored list.
    fn drop_or_store(&mut self, lease: ClientLease) {
        if lease.is_static {
            self.store_lease(lease);
        }
    }

    fn timer_slot(
        &mut self,
        event: TimerEvent,
    ) -> &mut Option<TimerHandle> {
        match event {
            TimerEvent::SendDiscover => &mut self.timers.send_discover,
            TimerEvent::StateSelecting => &mut self.timers.state_selecting,
            TimerEvent::SendRequest => &mut self.timers.send_request,
            TimerEvent::StateBound => &mut self.timers.state_bound,
            TimerEvent::StateInit => &mut self.timers.state_init,
        }
    }

    fn replace_timer(
        &mut self,
        ctx: &mut ClientCtx<'_>,
        event: TimerEvent,
        when_usec: i64,
    ) {
        let id = self.id;
        let slot = self.timer_slot(event);
        if let Some(handle) = slot.take() {
            ctx.timers.cancel(handle);
        }
        *slot = Some(ctx.timers.schedule(
            when_usec,
            TimerToken { client: id, event },
        ));
    }

    fn cancel_timer(&mut self, ctx: &mut ClientCtx<'_>, event: TimerEvent) {
        if let Some(handle) = self.timer_slot(event).take() {
            ctx.timers.cancel(handle);
        }
    }

    fn cancel_all_timers(&mut self, ctx: &mut ClientCtx<'_>) {
        for event in [
            TimerEvent::SendDiscover,
            TimerEvent::StateSelecting,
            TimerEvent::SendRequest,
            TimerEvent::StateBound,
            TimerEvent::StateInit,
        ] {
            self.cancel_timer(ctx, event);
        }
    }
}

fn jitter_usec(interval: i64) -> i64 {
    // A zero-microsecond schedule shared by clock-synchronized peers
    // would hit the server in lockstep.
    if interval > 1 {
        rand::thread_rng().gen_range(0..USEC_PER_SEC)
    } else {
        0
    }
}
