//! Address-domain helpers: shifting between the pod range and the shadow
//! range, subnet enumeration and port-range masks.

use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use pkg_types::network::LogicalNetwork;
use pkg_types::node::Node;

/// The first two octets of a network, the part that shifting swaps.
pub fn b_class_prefix(cidr: Ipv4Net) -> [u8; 2] {
    let o = cidr.network().octets();
    [o[0], o[1]]
}

/// Replace the first two octets of `ip` with `prefix`.
pub fn shift_ip(ip: Ipv4Addr, prefix: [u8; 2]) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(prefix[0], prefix[1], o[2], o[3])
}

/// Map a shifted address back into `cidr`'s /16.
pub fn unshift_ip(ip: Ipv4Addr, cidr: Ipv4Net) -> Ipv4Addr {
    shift_ip(ip, b_class_prefix(cidr))
}

/// Usable host addresses of `cidr`: network and broadcast are excluded
/// unless that would leave nothing.
pub fn subnet_hosts(cidr: Ipv4Net) -> Vec<Ipv4Addr> {
    // `hosts()` keeps every address for /31 and /32
    cidr.trunc().hosts().collect()
}

/// First usable host of `cidr`, conventionally the network gateway.
pub fn gateway_ip(cidr: Ipv4Net) -> Option<Ipv4Addr> {
    cidr.trunc().hosts().next()
}

/// Cover `[min, max]` with the fewest (value, mask) pairs.
pub fn port_range_matches(min: u16, max: u16) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    if min > max {
        return out;
    }
    let max = u32::from(max);
    let mut start = u32::from(min);
    while start <= max {
        let mut size: u32 = 1;
        while start % (size * 2) == 0 && start + size * 2 - 1 <= max && size < 0x1_0000 {
            size *= 2;
        }
        let mask = !(size - 1) as u16;
        out.push((start as u16, mask));
        start += size;
    }
    out
}

/// `cidr` with every `excepts` range carved out, as a sorted list of
/// covering prefixes. Excepts outside `cidr` are ignored.
pub fn subtract_nets(cidr: Ipv4Net, excepts: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut remaining = vec![cidr.trunc()];
    for except in excepts.iter().map(Ipv4Net::trunc) {
        remaining = remaining
            .into_iter()
            .flat_map(|net| carve(net, except))
            .collect();
    }
    remaining.sort();
    remaining
}

fn carve(net: Ipv4Net, except: Ipv4Net) -> Vec<Ipv4Net> {
    if except.contains(&net) {
        return Vec::new();
    }
    if !net.contains(&except) {
        return vec![net];
    }
    // halve towards `except`, keeping the sibling each time
    let mut out = Vec::new();
    let mut current = net;
    while current != except {
        let Ok(mut halves) = current.subnets(current.prefix_len() + 1) else {
            break;
        };
        let (Some(low), Some(high)) = (halves.next(), halves.next()) else {
            break;
        };
        if low.contains(&except) {
            out.push(high);
            current = low;
        } else {
            out.push(low);
            current = high;
        }
    }
    out
}

/// node IP → gateway IP of that node's network (`network_id == hostname`).
///
/// Endpoint addresses equal to a node IP belong to host-network pods and are
/// reached through the node's gateway address instead.
pub fn node_ip_gateway_map(
    nodes: &[Node],
    networks: &[LogicalNetwork],
) -> HashMap<Ipv4Addr, Ipv4Addr> {
    nodes
        .iter()
        .filter_map(|node| {
            networks
                .iter()
                .find(|n| n.network_id == node.hostname)
                .map(|n| (node.node_ip, n.gateway_ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn subtract_carves_out_excepts() {
        let rest = subtract_nets(net("10.10.1.0/24"), &[net("10.10.1.6/32")]);
        assert_eq!(rest.len(), 8);
        let size: u32 = rest.iter().map(|n| 1u32 << (32 - n.prefix_len())).sum();
        assert_eq!(size, 255);
        let hole = Ipv4Addr::new(10, 10, 1, 6);
        assert!(rest.iter().all(|n| !n.contains(&hole)));
        assert!(rest.iter().any(|n| n.contains(&Ipv4Addr::new(10, 10, 1, 7))));

        let rest = subtract_nets(net("10.10.1.0/24"), &[net("10.10.1.0/25"), net("10.20.0.0/16")]);
        assert_eq!(rest, vec![net("10.10.1.128/25")]);
        assert!(subtract_nets(net("10.10.1.0/24"), &[net("10.10.0.0/16")]).is_empty());
    }

    #[test]
    fn shift_and_unshift() {
        let pod = Ipv4Addr::new(10, 10, 3, 7);
        let shifted = shift_ip(pod, b_class_prefix(net("172.10.0.0/16")));
        assert_eq!(shifted, Ipv4Addr::new(172, 10, 3, 7));
        assert_eq!(unshift_ip(shifted, net("10.10.0.0/16")), pod);
    }

    #[test]
    fn subnet_excludes_network_and_broadcast() {
        let hosts = subnet_hosts(net("10.1.0.0/24"));
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(10, 1, 0, 254));
        assert_eq!(gateway_ip(net("10.1.0.0/24")), Some(Ipv4Addr::new(10, 1, 0, 1)));
        assert_eq!(subnet_hosts(net("10.1.0.4/30")).len(), 2);
    }

    #[test]
    fn port_range_masks() {
        assert_eq!(port_range_matches(80, 80), vec![(80, 0xffff)]);
        assert_eq!(
            port_range_matches(8080, 8087),
            vec![(8080, 0xfff8)]
        );
        assert_eq!(
            port_range_matches(1000, 1003),
            vec![(1000, 0xfffc)]
        );
        // 5 = 101, 6..7 = 11x, 8 = 1000
        assert_eq!(
            port_range_matches(5, 8),
            vec![(5, 0xffff), (6, 0xfffe), (8, 0xffff)]
        );
        assert!(port_range_matches(10, 9).is_empty());
    }

    #[test]
    fn port_range_covers_exactly() {
        let (min, max) = (1234u16, 5678u16);
        let pairs = port_range_matches(min, max);
        for p in 1000u16..6000 {
            let covered = pairs.iter().any(|(v, m)| p & m == v & m);
            assert_eq!(covered, (min..=max).contains(&p), "port {}", p);
        }
    }

    #[test]
    fn full_port_space() {
        assert_eq!(port_range_matches(0, u16::MAX), vec![(0, 0)]);
    }
}
