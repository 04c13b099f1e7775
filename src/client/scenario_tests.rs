// SPDX-License-Identifier: Apache-2.0

//! End-to-end state machine scenarios driven with a mock transport,
//! a scripted runner, and an explicit clock. No sockets, no sleeps.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use super::{
    ClientConfig, ClientCtx, ClientLease, ClientState, Dhcp4Client,
    TimerToken,
};
use crate::{
    dhcpv4::options::{
        DHO_LEASE_TIME, DHO_MESSAGE_TYPE, DHO_REBINDING_TIME,
        DHO_RENEWAL_TIME, DHO_REQUESTED_ADDRESS, DHO_ROUTERS,
        DHO_SERVER_IDENTIFIER, DHO_SUBNET_MASK,
    },
    dhcpv4::packet::{BOOTREPLY, BOOTP_BROADCAST},
    dhcpv4::{Dhcp4MessageType, Dhcp4Packet},
    iface::{HwAddr, Iface},
    journal::LeaseJournal,
    net::Transport,
    script::{ScriptEnv, ScriptRunner},
    time::USEC_PER_SEC,
    timer::TimerWheel,
    DhcpError, ErrorKind,
};

const HW: [u8; 6] = [0x00, 0x23, 0x45, 0x67, 0x89, 0x1a];
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 50);
const T0: i64 = 1_700_000_000;

#[derive(Debug, Default)]
struct MockTransport {
    broadcasts: Vec<Vec<u8>>,
    unicasts: Vec<(Ipv4Addr, Ipv4Addr, Vec<u8>)>,
}

impl Transport for MockTransport {
    fn send_broadcast(&mut self, frame: &[u8]) -> Result<(), DhcpError> {
        self.broadcasts.push(frame.to_vec());
        Ok(())
    }

    fn send_unicast(
        &mut self,
        from: Ipv4Addr,
        to: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), DhcpError> {
        self.unicasts.push((from, to, payload.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockScript {
    exit_codes: RefCell<VecDeque<i32>>,
    invocations: RefCell<Vec<ScriptEnv>>,
}

impl MockScript {
    fn push_exit_code(&self, code: i32) {
        self.exit_codes.borrow_mut().push_back(code);
    }

    fn reasons(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .filter_map(|env| env.get("reason").map(|r| r.to_string()))
            .collect()
    }

    fn last_env_with_reason(&self, reason: &str) -> Option<ScriptEnv> {
        self.invocations
            .borrow()
            .iter()
            .rev()
            .find(|env| env.get("reason") == Some(reason))
            .cloned()
    }
}

impl ScriptRunner for MockScript {
    fn run(&self, env: &ScriptEnv) -> Result<i32, DhcpError> {
        self.invocations.borrow_mut().push(env.clone());
        Ok(self.exit_codes.borrow_mut().pop_front().unwrap_or(0))
    }
}

struct Harness {
    client: Dhcp4Client,
    timers: TimerWheel<TimerToken>,
    transport: MockTransport,
    script: MockScript,
    journal: LeaseJournal,
    journal_path: PathBuf,
    now: i64,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.journal_path);
    }
}

impl Harness {
    fn new(tag: &str, config: ClientConfig) -> Self {
        let iface = Iface {
            name: "dhcpcli".to_string(),
            index: 7,
            hw: HwAddr::new_ethernet(HW),
            requested: true,
            automatic: false,
            running: true,
        };
        let journal_path = std::env::temp_dir().join(format!(
            "lessee_scenario_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&journal_path);
        Self {
            client: Dhcp4Client::new(0, iface, config),
            timers: TimerWheel::new(),
            transport: MockTransport::default(),
            script: MockScript::default(),
            journal: LeaseJournal::new(&journal_path),
            journal_path,
            now: T0,
        }
    }

    fn start(&mut self, recovered: Option<ClientLease>) {
        let mut ctx = ClientCtx {
            now: self.now,
            now_usec: self.now * USEC_PER_SEC,
            timers: &mut self.timers,
            transport: &mut self.transport,
            script: &self.script,
            journal: &mut self.journal,
        };
        self.client.start(&mut ctx, recovered).unwrap();
    }

    fn deliver(
        &mut self,
        packet: &Dhcp4Packet,
        from: Ipv4Addr,
    ) -> Result<(), DhcpError> {
        let mut ctx = ClientCtx {
            now: self.now,
            now_usec: self.now * USEC_PER_SEC,
            timers: &mut self.timers,
            transport: &mut self.transport,
            script: &self.script,
            journal: &mut self.journal,
        };
        self.client.handle_packet(&mut ctx, packet, from)
    }

    fn release(&mut self) {
        let mut ctx = ClientCtx {
            now: self.now,
            now_usec: self.now * USEC_PER_SEC,
            timers: &mut self.timers,
            transport: &mut self.transport,
            script: &self.script,
            journal: &mut self.journal,
        };
        self.client.do_release(&mut ctx).unwrap();
    }

    /// Fire every timer due up to (and including the sub-second jitter
    /// of) the current clock second.
    fn run_due(&mut self) -> Result<(), DhcpError> {
        let due = self
            .timers
            .pop_due(self.now * USEC_PER_SEC + USEC_PER_SEC - 1);
        for token in due {
            let mut ctx = ClientCtx {
                now: self.now,
                now_usec: self.now * USEC_PER_SEC,
                timers: &mut self.timers,
                transport: &mut self.transport,
                script: &self.script,
                journal: &mut self.journal,
            };
            self.client.handle_timer(&mut ctx, token.event)?;
        }
        Ok(())
    }

    /// Jump the clock to the next pending timer and fire it.
    fn advance_to_next_timer(&mut self) -> Result<(), DhcpError> {
        let deadline = self
            .timers
            .next_deadline_usec()
            .expect("no timer scheduled");
        self.now = self.now.max(deadline.div_euclid(USEC_PER_SEC));
        self.run_due()
    }

    fn last_broadcast(&self) -> Dhcp4Packet {
        let frame = self
            .transport
            .broadcasts
            .last()
            .expect("no broadcast sent");
        Dhcp4Packet::parse_eth(frame).unwrap().0
    }

    fn last_unicast(&self) -> (Ipv4Addr, Ipv4Addr, Dhcp4Packet) {
        let (from, to, payload) = self
            .transport
            .unicasts
            .last()
            .expect("no unicast sent");
        (*from, *to, Dhcp4Packet::parse(payload).unwrap())
    }

    fn current_xid(&self) -> u32 {
        self.last_broadcast().xid
    }
}

fn reply_packet(xid: u32, yiaddr: Ipv4Addr) -> Dhcp4Packet {
    let mut packet = Dhcp4Packet {
        op: BOOTREPLY,
        htype: 1,
        hlen: 6,
        xid,
        yiaddr,
        flags: BOOTP_BROADCAST,
        ..Default::default()
    };
    packet.chaddr[..6].copy_from_slice(&HW);
    packet
}

fn offer(
    xid: u32,
    yiaddr: Ipv4Addr,
    lease_time: u32,
    renewal: u32,
    rebind: u32,
) -> Dhcp4Packet {
    let mut packet = reply_packet(xid, yiaddr);
    packet
        .options
        .save_dhcp_raw(DHO_MESSAGE_TYPE, &[Dhcp4MessageType::Offer as u8]);
    packet
        .options
        .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &SERVER.octets());
    packet
        .options
        .save_dhcp_raw(DHO_LEASE_TIME, &lease_time.to_be_bytes());
    packet
        .options
        .save_dhcp_raw(DHO_RENEWAL_TIME, &renewal.to_be_bytes());
    packet
        .options
        .save_dhcp_raw(DHO_REBINDING_TIME, &rebind.to_be_bytes());
    packet
        .options
        .save_dhcp_raw(DHO_SUBNET_MASK, &[255, 255, 255, 0]);
    packet
}

fn ack(
    xid: u32,
    yiaddr: Ipv4Addr,
    lease_time: u32,
    renewal: u32,
    rebind: u32,
) -> Dhcp4Packet {
    let mut packet = offer(xid, yiaddr, lease_time, renewal, rebind);
    packet
        .options
        .save_dhcp_raw(DHO_MESSAGE_TYPE, &[Dhcp4MessageType::Ack as u8]);
    packet
}

fn nak(xid: u32) -> Dhcp4Packet {
    let mut packet = reply_packet(xid, Ipv4Addr::UNSPECIFIED);
    packet
        .options
        .save_dhcp_raw(DHO_MESSAGE_TYPE, &[Dhcp4MessageType::Nak as u8]);
    packet
        .options
        .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &SERVER.octets());
    packet
}

/// Drive a harness from INIT to BOUND with the standard DORA exchange.
fn acquire_lease(harness: &mut Harness) {
    harness.start(None);
    let xid = harness.current_xid();
    harness.deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER).unwrap();
    if !matches!(harness.client.state(), ClientState::Requesting { .. }) {
        harness.advance_to_next_timer().unwrap();
    }
    harness.deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER).unwrap();
    assert!(harness.client.state().is_bound());
}

#[test]
fn test_fresh_dora() {
    let mut config = ClientConfig::new();
    config.set_select_interval(5);
    let mut harness = Harness::new("dora", config);

    harness.start(None);
    assert_eq!(harness.transport.broadcasts.len(), 1);
    let discover = harness.last_broadcast();
    assert_eq!(discover.packet_type(), Dhcp4MessageType::Discover as u8);
    assert_eq!(discover.flags, BOOTP_BROADCAST);
    let xid = discover.xid;

    // Offer arrives one second in; selection waits for the full
    // select interval before committing.
    harness.now = T0 + 1;
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    assert!(matches!(
        harness.client.state(),
        ClientState::Selecting { .. }
    ));

    harness.advance_to_next_timer().unwrap();
    assert_eq!(harness.now, T0 + 5);
    assert!(matches!(
        harness.client.state(),
        ClientState::Requesting { .. }
    ));
    let request = harness.last_broadcast();
    assert_eq!(request.packet_type(), Dhcp4MessageType::Request as u8);
    assert_eq!(
        request.options.ipv4_dhcp(DHO_REQUESTED_ADDRESS),
        Some(OFFERED)
    );
    assert_eq!(
        request.options.ipv4_dhcp(DHO_SERVER_IDENTIFIER),
        Some(SERVER)
    );

    harness.now = T0 + 6;
    harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    assert!(harness.client.state().is_bound());

    let env = harness
        .script
        .last_env_with_reason("BOUND")
        .expect("BOUND script not run");
    assert_eq!(env.get("new_ip_address"), Some("192.0.2.50"));
    assert_eq!(
        env.get("new_expiry"),
        Some((harness.now + 600).to_string().as_str())
    );
    assert_eq!(env.get("requested_subnet_mask"), Some("1"));

    // One journal entry for the committed lease.
    assert_eq!(harness.journal.entries().len(), 1);
    assert_eq!(harness.journal.entries()[0].lease.address, OFFERED);

    // T1 timer armed at the (randomized) renewal time.
    let lease = harness.client.state().active_lease().unwrap().clone();
    let deadline = harness.timers.next_deadline_usec().unwrap();
    assert_eq!(deadline.div_euclid(USEC_PER_SEC), lease.renewal);
    assert!(lease.renewal >= harness.now + 225);
    assert!(lease.renewal <= harness.now + 300);
    assert!(lease.renewal <= lease.rebind && lease.rebind <= lease.expiry);
}

#[test]
fn test_renewal_then_rebind_then_expire() {
    let mut harness = Harness::new("renew_rebind", ClientConfig::new());
    acquire_lease(&mut harness);
    let lease = harness.client.state().active_lease().unwrap().clone();

    // T1: renewal goes out unicast to the leasing server.
    harness.advance_to_next_timer().unwrap();
    assert!(matches!(
        harness.client.state(),
        ClientState::Renewing { .. }
    ));
    let (from, to, request) = harness.last_unicast();
    assert_eq!(from, OFFERED);
    assert_eq!(to, SERVER);
    assert_eq!(request.packet_type(), Dhcp4MessageType::Request as u8);
    assert_eq!(request.ciaddr, OFFERED);

    // Server stays silent: retransmissions back off until T2 passes,
    // then the request switches to broadcast.
    let mut guard = 0;
    while matches!(harness.client.state(), ClientState::Renewing { .. }) {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 100, "never reached REBINDING");
    }
    assert!(matches!(
        harness.client.state(),
        ClientState::Rebinding { .. }
    ));
    assert!(harness.now > lease.rebind);
    let rebind_request = harness.last_broadcast();
    assert_eq!(
        rebind_request.packet_type(),
        Dhcp4MessageType::Request as u8
    );
    assert_eq!(rebind_request.ciaddr, OFFERED);

    // Still silent past expiry: EXPIRE, PREINIT, back to discovery.
    let mut guard = 0;
    while matches!(harness.client.state(), ClientState::Rebinding { .. }) {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 100, "never expired");
    }
    assert!(harness.now > lease.expiry);
    assert!(matches!(
        harness.client.state(),
        ClientState::Selecting { .. }
    ));
    let reasons = harness.script.reasons();
    let expire_pos =
        reasons.iter().position(|r| r == "EXPIRE").expect("no EXPIRE");
    assert_eq!(reasons.get(expire_pos + 1).map(|s| s.as_str()), Some("PREINIT"));
    let env = harness.script.last_env_with_reason("EXPIRE").unwrap();
    assert_eq!(env.get("old_ip_address"), Some("192.0.2.50"));
    assert_eq!(
        harness.last_broadcast().packet_type(),
        Dhcp4MessageType::Discover as u8
    );
}

#[test]
fn test_nak_during_renewing() {
    let mut harness = Harness::new("nak_renew", ClientConfig::new());
    acquire_lease(&mut harness);
    let xid = harness.current_xid();

    harness.advance_to_next_timer().unwrap();
    assert!(matches!(
        harness.client.state(),
        ClientState::Renewing { .. }
    ));

    let discover_count_before = harness.transport.broadcasts.len();
    harness.deliver(&nak(xid), SERVER).unwrap();

    let reasons = harness.script.reasons();
    let expire_pos =
        reasons.iter().position(|r| r == "EXPIRE").expect("no EXPIRE");
    assert_eq!(reasons.get(expire_pos + 1).map(|s| s.as_str()), Some("PREINIT"));
    assert!(matches!(
        harness.client.state(),
        ClientState::Selecting { .. }
    ));
    assert!(harness.client.state().active_lease().is_none());
    // A fresh DISCOVER went out immediately.
    assert!(harness.transport.broadcasts.len() > discover_count_before);
    assert_eq!(
        harness.last_broadcast().packet_type(),
        Dhcp4MessageType::Discover as u8
    );
}

#[test]
fn test_panic_with_fallback_lease() {
    let mut config = ClientConfig::new();
    config.set_timeout(10);
    let mut fallback = ClientLease {
        address: Ipv4Addr::new(192, 0, 2, 200),
        expiry: T0 + 3600,
        renewal: T0 + 1800,
        rebind: T0 + 3000,
        ..Default::default()
    };
    fallback
        .options
        .save_dhcp_raw(DHO_SUBNET_MASK, &[255, 255, 255, 0]);
    config.add_static_lease(fallback);
    let mut harness = Harness::new("panic", config);

    harness.start(None);
    // No offers: retransmit until the panic deadline.
    let mut guard = 0;
    while !harness.client.state().is_bound() {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 50, "panic never engaged");
    }

    let env = harness.script.last_env_with_reason("TIMEOUT").unwrap();
    assert_eq!(env.get("new_ip_address"), Some("192.0.2.200"));

    // Renewal is still ahead: BOUND with the T1 timer at renewal.
    let deadline = harness.timers.next_deadline_usec().unwrap();
    assert_eq!(deadline.div_euclid(USEC_PER_SEC), T0 + 1800);
}

#[test]
fn test_panic_fallback_past_renewal_renews_immediately() {
    let mut config = ClientConfig::new();
    config.set_timeout(10);
    let mut fallback = ClientLease {
        address: Ipv4Addr::new(192, 0, 2, 200),
        expiry: T0 + 3600,
        renewal: T0 - 10,
        rebind: T0 + 3000,
        ..Default::default()
    };
    fallback
        .options
        .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &SERVER.octets());
    config.add_static_lease(fallback);
    let mut harness = Harness::new("panic_renew", config);

    harness.start(None);
    let mut guard = 0;
    while !matches!(harness.client.state(), ClientState::Renewing { .. }) {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 50, "immediate renewal never happened");
    }
    // The lease was due: straight into a renewal REQUEST.
    let (_, to, request) = harness.last_unicast();
    assert_eq!(to, SERVER);
    assert_eq!(request.ciaddr, Ipv4Addr::new(192, 0, 2, 200));
}

#[test]
fn test_panic_without_leases_schedules_retry() {
    let mut config = ClientConfig::new();
    config.set_timeout(10);
    let mut harness = Harness::new("panic_retry", config);

    harness.start(None);
    let mut guard = 0;
    while !harness.script.reasons().iter().any(|r| r == "FAIL") {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 50, "FAIL never ran");
    }
    assert!(matches!(harness.client.state(), ClientState::Init));
    // Retry scheduled inside [retry/2, 3*retry/2).
    let deadline = harness
        .timers
        .next_deadline_usec()
        .unwrap()
        .div_euclid(USEC_PER_SEC);
    let delay = deadline - harness.now;
    assert!(delay >= 150, "delay {delay} too short");
    assert!(delay < 451, "delay {delay} too long");
}

#[test]
fn test_address_collision_declines() {
    let mut harness = Harness::new("decline", ClientConfig::new());
    harness.start(None);
    let xid = harness.current_xid();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    if !matches!(harness.client.state(), ClientState::Requesting { .. }) {
        harness.advance_to_next_timer().unwrap();
    }

    // The BOUND script reports another host using the address.
    harness.script.push_exit_code(1);
    harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();

    let decline = harness.last_broadcast();
    assert_eq!(decline.packet_type(), Dhcp4MessageType::Decline as u8);
    assert_eq!(
        decline.options.ipv4_dhcp(DHO_REQUESTED_ADDRESS),
        Some(OFFERED)
    );
    assert!(matches!(harness.client.state(), ClientState::Declining));

    // INIT re-entry comes only after the decline quarantine.
    let deadline = harness
        .timers
        .next_deadline_usec()
        .unwrap()
        .div_euclid(USEC_PER_SEC);
    assert_eq!(deadline, harness.now + 10);
    harness.advance_to_next_timer().unwrap();
    assert!(matches!(
        harness.client.state(),
        ClientState::Selecting { .. }
    ));
}

#[test]
fn test_address_collision_onetry_exits() {
    let mut config = ClientConfig::new();
    config.set_onetry(true);
    let mut harness = Harness::new("decline_onetry", config);
    harness.start(None);
    let xid = harness.current_xid();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    if !matches!(harness.client.state(), ClientState::Requesting { .. }) {
        harness.advance_to_next_timer().unwrap();
    }

    harness.script.push_exit_code(1);
    let err = harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoLease);
}

#[test]
fn test_release_while_bound() {
    let mut harness = Harness::new("release", ClientConfig::new());
    acquire_lease(&mut harness);

    harness.now += 50;
    harness.release();

    // DHCPRELEASE unicast to the server identifier, ciaddr filled.
    let (_, to, release) = harness.last_unicast();
    assert_eq!(to, SERVER);
    assert_eq!(release.packet_type(), Dhcp4MessageType::Release as u8);
    assert_eq!(release.ciaddr, OFFERED);

    // Journal rewritten with the lease clocked out.
    let entry = &harness.journal.entries()[0];
    assert_eq!(entry.lease.expiry, harness.now);
    assert_eq!(entry.lease.renewal, harness.now);
    assert_eq!(entry.lease.rebind, harness.now);

    let env = harness.script.last_env_with_reason("RELEASE").unwrap();
    assert_eq!(env.get("old_ip_address"), Some("192.0.2.50"));

    assert!(matches!(harness.client.state(), ClientState::Stopped));
    assert!(harness.timers.is_empty());
}

#[test]
fn test_stop_keeps_lease_but_cancels_timers() {
    let mut harness = Harness::new("stop", ClientConfig::new());
    acquire_lease(&mut harness);

    let mut ctx = ClientCtx {
        now: harness.now,
        now_usec: harness.now * USEC_PER_SEC,
        timers: &mut harness.timers,
        transport: &mut harness.transport,
        script: &harness.script,
        journal: &mut harness.journal,
    };
    harness.client.stop(&mut ctx);

    assert!(matches!(harness.client.state(), ClientState::Stopped));
    assert!(harness.timers.is_empty());
    let env = harness.script.last_env_with_reason("STOP").unwrap();
    assert_eq!(env.get("old_ip_address"), Some("192.0.2.50"));
    // No DHCPRELEASE went out.
    assert!(harness.transport.unicasts.is_empty());
}

#[test]
fn test_offer_with_wrong_xid_ignored() {
    let mut harness = Harness::new("wrong_xid", ClientConfig::new());
    harness.start(None);
    let xid = harness.current_xid();
    harness
        .deliver(
            &offer(xid.wrapping_add(1), OFFERED, 600, 300, 525),
            SERVER,
        )
        .unwrap();
    if let ClientState::Selecting { offered } = harness.client.state() {
        assert!(offered.is_empty());
    } else {
        panic!("left SELECTING on a foreign xid");
    }
}

#[test]
fn test_offer_with_wrong_chaddr_ignored() {
    let mut harness = Harness::new("wrong_chaddr", ClientConfig::new());
    harness.start(None);
    let xid = harness.current_xid();
    let mut packet = offer(xid, OFFERED, 600, 300, 525);
    packet.chaddr[5] ^= 0xff;
    harness.deliver(&packet, SERVER).unwrap();
    if let ClientState::Selecting { offered } = harness.client.state() {
        assert!(offered.is_empty());
    } else {
        panic!("left SELECTING on a foreign chaddr");
    }
}

#[test]
fn test_offer_missing_required_option_ignored() {
    let mut config = ClientConfig::new();
    config.set_select_interval(5);
    config.add_required_option(DHO_ROUTERS);
    let mut harness = Harness::new("required", config);
    harness.start(None);
    let xid = harness.current_xid();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    if let ClientState::Selecting { offered } = harness.client.state() {
        assert!(offered.is_empty());
    } else {
        panic!("offer without required option was accepted");
    }
}

#[test]
fn test_duplicate_offer_dropped_and_preferred_address_wins() {
    let mut config = ClientConfig::new();
    config.set_select_interval(30);
    config.set_requested_address(Ipv4Addr::new(192, 0, 2, 77));
    let mut harness = Harness::new("dedup", config);
    harness.start(None);
    let xid = harness.current_xid();

    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    // The offer matching the requested address goes to the head.
    harness
        .deliver(
            &offer(xid, Ipv4Addr::new(192, 0, 2, 77), 600, 300, 525),
            Ipv4Addr::new(192, 0, 2, 9),
        )
        .unwrap();
    if let ClientState::Selecting { offered } = harness.client.state() {
        assert_eq!(offered.len(), 2);
        assert_eq!(offered[0].address, Ipv4Addr::new(192, 0, 2, 77));
    } else {
        panic!("not selecting");
    }

    harness.advance_to_next_timer().unwrap();
    let request = harness.last_broadcast();
    assert_eq!(
        request.options.ipv4_dhcp(DHO_REQUESTED_ADDRESS),
        Some(Ipv4Addr::new(192, 0, 2, 77))
    );
}

#[test]
fn test_zero_lease_time_ack_rejects_server() {
    let mut harness = Harness::new("zero_lease", ClientConfig::new());
    harness.start(None);
    let xid = harness.current_xid();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    if !matches!(harness.client.state(), ClientState::Requesting { .. }) {
        harness.advance_to_next_timer().unwrap();
    }

    let mut bad_ack = reply_packet(xid, OFFERED);
    bad_ack
        .options
        .save_dhcp_raw(DHO_MESSAGE_TYPE, &[Dhcp4MessageType::Ack as u8]);
    bad_ack
        .options
        .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &SERVER.octets());
    harness.deliver(&bad_ack, SERVER).unwrap();

    // Not bound; INIT retry pending half a second out.
    assert!(!harness.client.state().is_bound());
    assert!(harness.timers.next_deadline_usec().is_some());

    // The server is quenched: even a good ACK from it is now ignored.
    harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    assert!(!harness.client.state().is_bound());
}

#[test]
fn test_reboot_with_recovered_lease() {
    let mut harness = Harness::new("reboot", ClientConfig::new());
    let mut recovered = ClientLease {
        address: OFFERED,
        expiry: T0 + 400,
        renewal: T0 + 100,
        rebind: T0 + 300,
        ..Default::default()
    };
    recovered
        .options
        .save_dhcp_raw(DHO_SERVER_IDENTIFIER, &SERVER.octets());

    harness.start(Some(recovered));
    assert!(matches!(
        harness.client.state(),
        ClientState::Rebooting { .. }
    ));
    let request = harness.last_broadcast();
    assert_eq!(request.packet_type(), Dhcp4MessageType::Request as u8);
    assert_eq!(
        request.options.ipv4_dhcp(DHO_REQUESTED_ADDRESS),
        Some(OFFERED)
    );

    let xid = request.xid;
    harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    assert!(harness.client.state().is_bound());
    let env = harness.script.last_env_with_reason("REBOOT").unwrap();
    assert_eq!(env.get("new_ip_address"), Some("192.0.2.50"));
}

#[test]
fn test_reboot_timeout_falls_back_to_discovery() {
    let mut harness = Harness::new("reboot_timeout", ClientConfig::new());
    let recovered = ClientLease {
        address: OFFERED,
        expiry: T0 + 4000,
        renewal: T0 + 1000,
        rebind: T0 + 3000,
        ..Default::default()
    };
    harness.start(Some(recovered));

    let mut guard = 0;
    while !matches!(
        harness.client.state(),
        ClientState::Selecting { .. }
    ) {
        harness.advance_to_next_timer().unwrap();
        guard += 1;
        assert!(guard < 20, "never fell back to discovery");
    }
    assert_eq!(
        harness.last_broadcast().packet_type(),
        Dhcp4MessageType::Discover as u8
    );
}

#[test]
fn test_retransmit_interval_never_exceeds_twice_cutoff() {
    let mut config = ClientConfig::new();
    config.set_timeout(100_000);
    let mut harness = Harness::new("backoff", config);
    harness.start(None);

    let cutoff = 15i64;
    let mut prev_deadline = harness
        .timers
        .next_deadline_usec()
        .unwrap()
        .div_euclid(USEC_PER_SEC);
    for _ in 0..50 {
        harness.advance_to_next_timer().unwrap();
        let deadline = harness
            .timers
            .next_deadline_usec()
            .unwrap()
            .div_euclid(USEC_PER_SEC);
        let gap = deadline - prev_deadline;
        assert!(gap <= 2 * cutoff, "interval {gap} exceeds cutoff bound");
        prev_deadline = deadline;
    }
}

#[test]
fn test_media_cycling_during_discovery() {
    let mut config = ClientConfig::new();
    config.set_timeout(100_000);
    config.add_medium("media ethernet");
    config.add_medium("media aui");
    let mut harness = Harness::new("media", config);

    harness.start(None);
    let env = harness.script.last_env_with_reason("MEDIUM").unwrap();
    assert_eq!(env.get("medium"), Some("media ethernet"));

    // The next round with no offers advances the cursor.
    harness.advance_to_next_timer().unwrap();
    let env = harness.script.last_env_with_reason("MEDIUM").unwrap();
    assert_eq!(env.get("medium"), Some("media aui"));

    // An offer records the medium it arrived on.
    let xid = harness.current_xid();
    harness
        .deliver(&offer(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    harness
        .deliver(&ack(xid, OFFERED, 600, 300, 525), SERVER)
        .unwrap();
    assert!(harness.client.state().is_bound());
    let lease = harness.client.state().active_lease().unwrap();
    assert_eq!(lease.medium.as_deref(), Some("media aui"));
}

#[test]
fn test_bootp_reply_binds_with_synthetic_times() {
    let mut harness = Harness::new("bootp", ClientConfig::new());
    harness.start(None);
    let xid = harness.current_xid();

    // A plain BOOTREPLY: no DHCP options at all.
    let packet = reply_packet(xid, OFFERED);
    harness.deliver(&packet, SERVER).unwrap();

    assert!(harness.client.state().is_bound());
    let lease = harness.client.state().active_lease().unwrap();
    assert!(lease.is_bootp);
    assert_eq!(lease.expiry, harness.now + 12000);
    assert_eq!(lease.renewal, harness.now + 8000);
    assert_eq!(lease.rebind, harness.now + 10000);
}
