//! Local answers of the embedded DNS server.
//!
//! Everything here is synchronous: a query goes in, and either a reply
//! built from the sandbox's own records comes out or the query is marked
//! for forwarding.

use std::net::IpAddr;

use trust_dns_proto::op::{Message, MessageType, ResponseCode};
use trust_dns_proto::rr::{Name, RData, Record, RecordType, rdata};

use netplane_common::types::parse_reverse_name;

use super::ResolverBackend;

/// TTL of answers built from local records.
pub const LOCAL_TTL: u32 = 600;

/// What to do with a query.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Send this reply.
    Reply(Message),
    /// Ask the upstream servers.
    Forward,
    /// Malformed; answer nothing.
    Drop,
}

/// Build the skeleton of a reply to `query`.
pub(crate) fn reply_to(query: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    resp.add_queries(query.queries().to_vec());
    resp
}

/// Reply reporting that the name does not exist.
pub(crate) fn nxdomain(query: &Message) -> Message {
    let mut resp = reply_to(query);
    resp.set_response_code(ResponseCode::NXDomain);
    resp
}

/// Answer `query` from local records when possible.
pub(crate) fn answer(backend: &dyn ResolverBackend, query: &Message) -> Outcome {
    if query.message_type() != MessageType::Query {
        return Outcome::Drop;
    }
    let Some(q) = query.queries().first() else {
        return Outcome::Drop;
    };
    let name = q.name().to_ascii();
    let name = name.trim_end_matches('.');

    let local = match q.query_type() {
        RecordType::A => answer_ip(backend, query, name, false),
        RecordType::AAAA => answer_ip(backend, query, name, true),
        RecordType::MX => answer_mx(backend, query, name),
        RecordType::PTR => match parse_reverse_name(name) {
            Some(ip) => answer_ptr(backend, query, ip),
            None => {
                tracing::debug!(name, "Invalid PTR query");
                return Outcome::Drop;
            }
        },
        RecordType::SRV => answer_srv(backend, query, name),
        _ => None,
    };
    if let Some(resp) = local {
        return Outcome::Reply(resp);
    }

    // With a pinned ndots, single-label names never leave the sandbox.
    if backend.ndots_set() && !name.contains('.') {
        return Outcome::Reply(reply_to(query));
    }
    Outcome::Forward
}

fn answer_ip(backend: &dyn ResolverBackend, query: &Message, name: &str, v6: bool) -> Option<Message> {
    let (addrs, ipv6_miss) = backend.resolve_name(name, v6);
    let Some(addrs) = addrs else {
        // The name exists, just not for this family.
        return ipv6_miss.then(|| reply_to(query));
    };
    let owner = query.queries().first()?.name().clone();

    let mut resp = reply_to(query);
    for ip in addrs {
        let rdata = match ip {
            IpAddr::V4(v4) if !v6 => RData::A(rdata::A(v4)),
            IpAddr::V6(v6addr) if v6 => RData::AAAA(rdata::AAAA(v6addr)),
            _ => continue,
        };
        resp.add_answer(Record::from_rdata(owner.clone(), LOCAL_TTL, rdata));
    }
    tracing::trace!(name, v6, answers = resp.answers().len(), "Answered from local records");
    Some(resp)
}

/// Local names have no mail exchangers; say so instead of forwarding.
fn answer_mx(backend: &dyn ResolverBackend, query: &Message, name: &str) -> Option<Message> {
    let known = backend.resolve_name(name, false).0.is_some() || backend.resolve_name(name, true).0.is_some();
    known.then(|| reply_to(query))
}

fn answer_ptr(backend: &dyn ResolverBackend, query: &Message, ip: IpAddr) -> Option<Message> {
    let host = backend.resolve_ip(ip)?;
    let target = Name::from_ascii(format!("{host}.")).ok()?;
    let owner = query.queries().first()?.name().clone();

    let mut resp = reply_to(query);
    resp.add_answer(Record::from_rdata(owner, LOCAL_TTL, RData::PTR(rdata::PTR(target))));
    Some(resp)
}

fn answer_srv(backend: &dyn ResolverBackend, query: &Message, name: &str) -> Option<Message> {
    let targets = backend.resolve_service(name);
    if targets.is_empty() {
        return None;
    }
    let owner = query.queries().first()?.name().clone();

    let mut resp = reply_to(query);
    for target in targets {
        let Ok(host) = Name::from_ascii(format!("{}.", target.name)) else {
            continue;
        };
        let srv = rdata::SRV::new(1, 1, target.port, host.clone());
        resp.add_answer(Record::from_rdata(owner.clone(), LOCAL_TTL, RData::SRV(srv)));
        let addr = match target.ip {
            IpAddr::V4(v4) => RData::A(rdata::A(v4)),
            IpAddr::V6(v6) => RData::AAAA(rdata::AAAA(v6)),
        };
        resp.add_additional(Record::from_rdata(host, LOCAL_TTL, addr));
    }
    Some(resp)
}

/// Largest reply `query` may get over UDP.
pub(crate) fn udp_size(query: &Message) -> usize {
    let edns = query
        .extensions()
        .as_ref()
        .map_or(0, |e| usize::from(e.max_payload()));
    edns.max(512)
}

/// Encode `resp`, dropping answers from the tail until it fits in
/// `max_size`. Over UDP a cut reply has the TC bit set.
pub(crate) fn encode(mut resp: Message, max_size: usize, tcp: bool) -> Option<Vec<u8>> {
    let mut bytes = resp.to_vec().ok()?;
    if bytes.len() <= max_size {
        return Some(bytes);
    }
    if !tcp {
        resp.set_truncated(true);
    }
    let srv = resp
        .queries()
        .first()
        .is_some_and(|q| q.query_type() == RecordType::SRV);

    let mut answers = resp.take_answers();
    let mut extras = resp.take_additionals();
    loop {
        resp.insert_answers(answers.clone());
        resp.insert_additionals(extras.clone());
        bytes = resp.to_vec().ok()?;
        if bytes.len() <= max_size || answers.is_empty() {
            return Some(bytes);
        }
        resp.take_answers();
        resp.take_additionals();
        answers.pop();
        if srv {
            extras.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use trust_dns_proto::op::Query;

    use super::*;
    use crate::service::ServiceTarget;

    #[derive(Default)]
    struct Records {
        v4: Vec<(String, Ipv4Addr)>,
        v6_only_miss: bool,
        ndots: bool,
    }

    impl ResolverBackend for Records {
        fn resolve_name(&self, name: &str, v6: bool) -> (Option<Vec<IpAddr>>, bool) {
            let ips: Vec<IpAddr> = self
                .v4
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, ip)| IpAddr::V4(*ip))
                .collect();
            if ips.is_empty() {
                return (None, false);
            }
            if v6 {
                return (None, self.v6_only_miss);
            }
            (Some(ips), false)
        }

        fn resolve_ip(&self, ip: IpAddr) -> Option<String> {
            self.v4
                .iter()
                .find(|(_, a)| IpAddr::V4(*a) == ip)
                .map(|(n, _)| format!("{n}.front"))
        }

        fn resolve_service(&self, name: &str) -> Vec<ServiceTarget> {
            if name != "_http._tcp.web" {
                return Vec::new();
            }
            (2..=4)
                .map(|i| ServiceTarget {
                    name: format!("web{i}"),
                    ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)),
                    port: 80,
                })
                .collect()
        }

        fn ndots_set(&self) -> bool {
            self.ndots
        }
    }

    fn query(name: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(42).set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        msg
    }

    fn reply(outcome: Outcome) -> Message {
        match outcome {
            Outcome::Reply(m) => m,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn backend() -> Records {
        Records {
            v4: vec![
                ("web".into(), Ipv4Addr::new(10, 0, 0, 2)),
                ("web".into(), Ipv4Addr::new(10, 0, 0, 3)),
            ],
            v6_only_miss: true,
            ndots: false,
        }
    }

    #[test]
    fn a_record_from_local_names() {
        let resp = reply(answer(&backend(), &query("web.", RecordType::A)));
        assert_eq!(resp.id(), 42);
        assert!(resp.recursion_available());
        assert_eq!(resp.answers().len(), 2);
        assert_eq!(resp.answers()[0].ttl(), LOCAL_TTL);
    }

    #[test]
    fn aaaa_for_v4_only_name_is_empty() {
        let resp = reply(answer(&backend(), &query("web.", RecordType::AAAA)));
        assert!(resp.answers().is_empty());
        assert_eq!(resp.response_code(), ResponseCode::NoError);
    }

    #[test]
    fn unknown_names_are_forwarded() {
        assert!(matches!(
            answer(&backend(), &query("example.com.", RecordType::A)),
            Outcome::Forward
        ));
        assert!(matches!(
            answer(&backend(), &query("example.com.", RecordType::TXT)),
            Outcome::Forward
        ));
    }

    #[test]
    fn mx_for_local_name_is_empty() {
        let resp = reply(answer(&backend(), &query("web.", RecordType::MX)));
        assert!(resp.answers().is_empty());
    }

    #[test]
    fn ptr_answers_and_bad_names_drop() {
        let resp = reply(answer(&backend(), &query("2.0.0.10.in-addr.arpa.", RecordType::PTR)));
        assert_eq!(resp.answers().len(), 1);
        match resp.answers()[0].data() {
            Some(RData::PTR(ptr)) => assert_eq!(ptr.0.to_ascii(), "web.front."),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            answer(&backend(), &query("x.in-addr.arpa.", RecordType::PTR)),
            Outcome::Drop
        ));
    }

    #[test]
    fn srv_carries_address_records() {
        let resp = reply(answer(&backend(), &query("_http._tcp.web.", RecordType::SRV)));
        assert_eq!(resp.answers().len(), 3);
        assert_eq!(resp.additionals().len(), 3);
    }

    #[test]
    fn pinned_ndots_keeps_single_labels_local() {
        let mut records = backend();
        records.ndots = true;
        let resp = reply(answer(&records, &query("unknown.", RecordType::A)));
        assert!(resp.answers().is_empty());
        assert!(matches!(
            answer(&records, &query("unknown.example.", RecordType::A)),
            Outcome::Forward
        ));
    }

    #[test]
    fn udp_replies_are_cut_to_fit() {
        let mut records = Records::default();
        for i in 0..60u8 {
            records.v4.push(("big".into(), Ipv4Addr::new(10, 1, 0, i)));
        }
        let q = query("big.", RecordType::A);
        assert_eq!(udp_size(&q), 512);

        let resp = reply(answer(&records, &q));
        let bytes = encode(resp.clone(), udp_size(&q), false).unwrap();
        assert!(bytes.len() <= 512);
        let cut = Message::from_vec(&bytes).unwrap();
        assert!(cut.truncated());
        assert!(cut.answers().len() < 60);

        let full = Message::from_vec(&encode(resp, 65535, true).unwrap()).unwrap();
        assert_eq!(full.answers().len(), 60);
        assert!(!full.truncated());
    }
}
