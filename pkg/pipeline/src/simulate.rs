//! Packet tracer over a device's installed tables.
//!
//! Models the subset of switch behaviour the reconcilers rely on: highest
//! priority match per table, goto/resubmit, select groups (bucket chosen by
//! flow hash) and connection tracking with commit and NAT.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use pkg_constants::network::ARP_OP_REPLY;
use pkg_constants::pipeline::{CT_STATE_ESTABLISHED, CT_STATE_NEW, CT_STATE_REPLY, CT_STATE_TRACKED, TableId};

use crate::flow::{Action, CtAction, CtNat, Criterion, FlowRule, GroupDescription, GroupId, Match};
use crate::packet::Packet;

const MAX_HOPS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Output { port: u32, packet: Packet },
    Controller(Packet),
    Flood(Packet),
    Drop,
    /// No rule matched in this table.
    Miss(TableId),
    /// Hop limit exceeded.
    Loop,
}

#[derive(Debug, Clone)]
pub struct Trace {
    pub verdict: Verdict,
    /// (table, priority) of every rule hit, in order.
    pub hops: Vec<(TableId, u16)>,
}

impl Trace {
    pub fn visited(&self, table: TableId) -> bool {
        self.hops.iter().any(|(t, _)| *t == table)
    }
}

pub fn matches(selector: &Match, pkt: &Packet) -> bool {
    selector.criteria().iter().all(|c| match c {
        Criterion::InPort(p) => pkt.in_port == *p,
        Criterion::EthType(t) => pkt.eth_type == *t,
        Criterion::EthSrc(m) => pkt.eth_src == *m,
        Criterion::EthDst(m) => pkt.eth_dst == *m,
        Criterion::TunnelId(id) => pkt.tunnel_id == Some(*id),
        Criterion::IpProto(p) => pkt.is_ipv4() && pkt.ip_proto == *p,
        Criterion::Ipv4Src(net) => pkt.is_ipv4() && net.contains(&pkt.ipv4_src),
        Criterion::Ipv4Dst(net) => pkt.is_ipv4() && net.contains(&pkt.ipv4_dst),
        Criterion::L4Src { port, mask } => pkt.is_ipv4() && pkt.l4_src & mask == port & mask,
        Criterion::L4Dst { port, mask } => pkt.is_ipv4() && pkt.l4_dst & mask == port & mask,
        Criterion::CtState { state, mask } => pkt.ct_state & mask == state & mask,
        Criterion::ArpOp(op) => pkt.is_arp() && pkt.arp_op == *op,
        Criterion::ArpSpa(ip) => pkt.is_arp() && pkt.ipv4_src == *ip,
        Criterion::ArpTpa(ip) => pkt.is_arp() && pkt.ipv4_dst == *ip,
    })
}

/// Snapshot of one device's flow and group tables.
#[derive(Debug, Clone, Default)]
pub struct DeviceTables {
    flows: Vec<FlowRule>,
    groups: HashMap<GroupId, GroupDescription>,
}

impl DeviceTables {
    pub fn new(flows: Vec<FlowRule>, groups: Vec<GroupDescription>) -> Self {
        Self {
            flows,
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
        }
    }

    pub fn flows(&self) -> &[FlowRule] {
        &self.flows
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupDescription> {
        self.groups.get(&id)
    }

    fn lookup(&self, table: TableId, pkt: &Packet) -> Option<&FlowRule> {
        let mut best: Option<&FlowRule> = None;
        for rule in self.flows.iter().filter(|r| r.table == table) {
            if matches(&rule.selector, pkt) && best.is_none_or(|b| rule.priority > b.priority) {
                best = Some(rule);
            }
        }
        best
    }

    /// Walk `packet` through the pipeline starting at `table`.
    pub fn trace(&self, ct: &mut Conntrack, packet: Packet, table: TableId) -> Trace {
        let mut pkt = packet;
        let mut table = table;
        let mut hops = Vec::new();
        loop {
            if hops.len() >= MAX_HOPS {
                return Trace {
                    verdict: Verdict::Loop,
                    hops,
                };
            }
            let Some(rule) = self.lookup(table, &pkt) else {
                return Trace {
                    verdict: Verdict::Miss(table),
                    hops,
                };
            };
            hops.push((table, rule.priority));
            match self.run(&rule.actions, &mut pkt, ct) {
                Step::Table(next) => table = next,
                Step::Done(verdict) => return Trace { verdict, hops },
            }
        }
    }

    fn run(&self, actions: &[Action], pkt: &mut Packet, ct: &mut Conntrack) -> Step {
        for action in actions {
            match action {
                Action::SetEthSrc(m) => pkt.eth_src = *m,
                Action::SetEthDst(m) => pkt.eth_dst = *m,
                Action::SetIpv4Src(ip) => pkt.ipv4_src = *ip,
                Action::SetIpv4Dst(ip) => pkt.ipv4_dst = *ip,
                Action::SetL4Src(p) => pkt.l4_src = *p,
                Action::SetL4Dst(p) => pkt.l4_dst = *p,
                Action::LoadSrcPrefix(prefix) => pkt.ipv4_src = load_prefix(pkt.ipv4_src, *prefix),
                Action::LoadDstPrefix(prefix) => pkt.ipv4_dst = load_prefix(pkt.ipv4_dst, *prefix),
                Action::SetTunnelId(id) => pkt.tunnel_id = Some(*id),
                Action::SetTunnelDst(ip) => pkt.tunnel_dst = Some(*ip),
                Action::Conntrack(action) => {
                    ct.process(pkt, action);
                    if let Some(t) = action.recirc_table {
                        return Step::Table(t);
                    }
                }
                Action::Group(id) => {
                    let Some(group) = self.groups.get(id) else {
                        return Step::Done(Verdict::Drop);
                    };
                    if group.buckets.is_empty() {
                        return Step::Done(Verdict::Drop);
                    }
                    let idx = (flow_hash(pkt) % group.buckets.len() as u64) as usize;
                    return self.run(&group.buckets[idx].actions, pkt, ct);
                }
                Action::Resubmit(t) | Action::Goto(t) => return Step::Table(*t),
                Action::Output(port) => {
                    return Step::Done(Verdict::Output {
                        port: *port,
                        packet: pkt.clone(),
                    });
                }
                Action::ArpReply(mac) => {
                    let reply = Packet {
                        eth_src: *mac,
                        eth_dst: pkt.eth_src,
                        ipv4_src: pkt.ipv4_dst,
                        ipv4_dst: pkt.ipv4_src,
                        arp_op: ARP_OP_REPLY,
                        ..pkt.clone()
                    };
                    return Step::Done(Verdict::Output {
                        port: pkt.in_port,
                        packet: reply,
                    });
                }
                Action::Flood => return Step::Done(Verdict::Flood(pkt.clone())),
                Action::Controller => return Step::Done(Verdict::Controller(pkt.clone())),
                Action::Drop => return Step::Done(Verdict::Drop),
            }
        }
        Step::Done(Verdict::Drop)
    }
}

enum Step {
    Table(TableId),
    Done(Verdict),
}

fn load_prefix(ip: Ipv4Addr, prefix: [u8; 2]) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(prefix[0], prefix[1], o[2], o[3])
}

fn flow_hash(pkt: &Packet) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let bytes = pkt
        .ipv4_src
        .octets()
        .into_iter()
        .chain(pkt.ipv4_dst.octets())
        .chain(pkt.l4_src.to_be_bytes())
        .chain(pkt.l4_dst.to_be_bytes())
        .chain([pkt.ip_proto]);
    for b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tuple {
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    proto: u8,
}

impl Tuple {
    fn of(pkt: &Packet) -> Self {
        Self {
            src: (pkt.ipv4_src, pkt.l4_src),
            dst: (pkt.ipv4_dst, pkt.l4_dst),
            proto: pkt.ip_proto,
        }
    }

    fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            proto: self.proto,
        }
    }
}

#[derive(Debug, Clone)]
struct Connection {
    orig: Tuple,
    reply: Tuple,
    nat: Option<CtNat>,
}

/// Connection tracking table shared by successive traces.
#[derive(Debug, Clone, Default)]
pub struct Conntrack {
    conns: Vec<Connection>,
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn process(&mut self, pkt: &mut Packet, action: &CtAction) {
        let tuple = Tuple::of(pkt);
        let existing = self.conns.iter().find_map(|c| {
            if c.orig == tuple {
                Some((c.clone(), false))
            } else if c.reply == tuple {
                Some((c.clone(), true))
            } else {
                None
            }
        });

        match existing {
            Some((conn, is_reply)) => {
                pkt.ct_state = CT_STATE_TRACKED | CT_STATE_ESTABLISHED;
                if is_reply {
                    pkt.ct_state |= CT_STATE_REPLY;
                }
                if action.nat.is_some() {
                    apply_existing(pkt, &conn, is_reply);
                }
            }
            None => {
                pkt.ct_state = CT_STATE_TRACKED | CT_STATE_NEW;
                let nat = match &action.nat {
                    Some(CtNat::Restore) | None => None,
                    Some(nat) => Some(nat.clone()),
                };
                if let Some(nat) = &nat {
                    translate(pkt, nat);
                }
                if action.commit {
                    self.conns.push(Connection {
                        orig: tuple,
                        reply: Tuple::of(pkt).reversed(),
                        nat,
                    });
                }
            }
        }
    }
}

fn translate(pkt: &mut Packet, nat: &CtNat) {
    match nat {
        CtNat::Dst { addr, port } => {
            pkt.ipv4_dst = *addr;
            if let Some(p) = port {
                pkt.l4_dst = *p;
            }
        }
        CtNat::Src { addr, port } => {
            pkt.ipv4_src = *addr;
            if let Some(p) = port {
                pkt.l4_src = *p;
            }
        }
        CtNat::Restore => {}
    }
}

fn apply_existing(pkt: &mut Packet, conn: &Connection, is_reply: bool) {
    let Some(nat) = &conn.nat else { return };
    if !is_reply {
        translate(pkt, nat);
        return;
    }
    match nat {
        CtNat::Dst { .. } => {
            pkt.ipv4_src = conn.orig.dst.0;
            pkt.l4_src = conn.orig.dst.1;
        }
        CtNat::Src { .. } => {
            pkt.ipv4_dst = conn.orig.src.0;
            pkt.l4_dst = conn.orig.src.1;
        }
        CtNat::Restore => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{GroupBucket, GroupDescription};
    use pkg_types::net::DeviceId;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn dev() -> DeviceId {
        DeviceId::new("of:1")
    }

    #[test]
    fn highest_priority_wins() {
        let tables = DeviceTables::new(
            vec![
                FlowRule::new("a", &dev(), 0, 10)
                    .matching(Match::ipv4())
                    .actions(vec![Action::Output(1)]),
                FlowRule::new("a", &dev(), 0, 20)
                    .matching(Match::ipv4().l4_dst(80))
                    .actions(vec![Action::Output(2)]),
            ],
            vec![],
        );
        let mut ct = Conntrack::new();
        let pkt = Packet::tcp((ip("10.0.0.1"), 1000), (ip("10.0.0.2"), 80));
        let trace = tables.trace(&mut ct, pkt.clone(), 0);
        assert!(matches!(trace.verdict, Verdict::Output { port: 2, .. }));

        let other = Packet::tcp((ip("10.0.0.1"), 1000), (ip("10.0.0.2"), 81));
        let trace = tables.trace(&mut ct, other, 0);
        assert!(matches!(trace.verdict, Verdict::Output { port: 1, .. }));
    }

    #[test]
    fn masked_port_match() {
        let m = Match::ipv4().l4_dst_masked(8080, 0xfff8);
        let hit = Packet::tcp((ip("10.0.0.1"), 1), (ip("10.0.0.2"), 8087));
        let miss = Packet::tcp((ip("10.0.0.1"), 1), (ip("10.0.0.2"), 8088));
        assert!(matches(&m, &hit));
        assert!(!matches(&m, &miss));
    }

    #[test]
    fn goto_loop_is_bounded() {
        let tables = DeviceTables::new(
            vec![
                FlowRule::new("a", &dev(), 1, 1).actions(vec![Action::Goto(2)]),
                FlowRule::new("a", &dev(), 2, 1).actions(vec![Action::Goto(1)]),
            ],
            vec![],
        );
        let pkt = Packet::tcp((ip("10.0.0.1"), 1), (ip("10.0.0.2"), 2));
        let trace = tables.trace(&mut Conntrack::new(), pkt, 1);
        assert_eq!(trace.verdict, Verdict::Loop);
    }

    #[test]
    fn conntrack_dnat_round_trip() {
        let vip = ip("10.96.0.10");
        let backend = ip("10.10.1.5");
        let client = ip("10.10.2.7");
        let tables = DeviceTables::new(
            vec![
                // untracked: track with nat, continue at 1
                FlowRule::new("a", &dev(), 0, 10)
                    .matching(Match::ipv4().ct_state(0, CT_STATE_TRACKED))
                    .actions(vec![Action::Conntrack(CtAction {
                        commit: false,
                        nat: Some(CtNat::Restore),
                        recirc_table: Some(1),
                    })]),
                FlowRule::new("a", &dev(), 1, 20)
                    .matching(
                        Match::ipv4()
                            .ct_state(CT_STATE_TRACKED | CT_STATE_NEW, CT_STATE_TRACKED | CT_STATE_NEW)
                            .ipv4_dst_host(vip),
                    )
                    .actions(vec![Action::Group(GroupId(1))]),
                FlowRule::new("a", &dev(), 1, 10)
                    .matching(Match::ipv4())
                    .actions(vec![Action::Output(9)]),
            ],
            vec![GroupDescription::select(
                "a",
                &dev(),
                GroupId(1),
                vec![GroupBucket::new(vec![
                    Action::Conntrack(CtAction {
                        commit: true,
                        nat: Some(CtNat::Dst {
                            addr: backend,
                            port: Some(8080),
                        }),
                        recirc_table: None,
                    }),
                    Action::Output(5),
                ])],
            )],
        );
        let mut ct = Conntrack::new();

        let first = Packet::tcp((client, 40000), (vip, 80));
        let Verdict::Output { port, packet } = tables.trace(&mut ct, first.clone(), 0).verdict else {
            panic!("expected output");
        };
        assert_eq!(port, 5);
        assert_eq!((packet.ipv4_dst, packet.l4_dst), (backend, 8080));
        assert_eq!(ct.len(), 1);

        // second packet of the same connection is established and translated
        let Verdict::Output { packet, .. } = tables.trace(&mut ct, first, 0).verdict else {
            panic!("expected output");
        };
        assert_eq!(packet.ipv4_dst, backend);
        assert_ne!(packet.ct_state & CT_STATE_ESTABLISHED, 0);

        let reply = Packet::tcp((backend, 8080), (client, 40000));
        let Verdict::Output { packet, .. } = tables.trace(&mut ct, reply, 0).verdict else {
            panic!("expected output");
        };
        assert_eq!((packet.ipv4_src, packet.l4_src), (vip, 80));
        assert_ne!(packet.ct_state & CT_STATE_REPLY, 0);
    }
}
