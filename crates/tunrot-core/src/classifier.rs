//! Traffic classifier: decides whether a packet stays on the host's original
//! path (`protected`) or is steered into the rotated tunnel (`rotated`).
//!
//! The policy is an ordered list of `(predicate, tag)` rules evaluated
//! first-match-wins. Every protected rule must precede every rotated rule and
//! the list must end in a rotated catch-all, either for every packet or for
//! the packets of the rotated principals; [`TrafficClassifier::new`] refuses
//! any other shape with [`ClassifierError::ProtectedPathLeak`].
//!
//! The same list is rendered to iptables mangle rules, in order, so the
//! kernel evaluates exactly what is tested here. A packet no rule matches is
//! left unmarked and stays on the main table.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;

/// Name-resolution port.
const DNS_PORT: u16 = 53;

/// Tag assigned to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Protected,
    Rotated,
}

/// Transport protocol of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

/// The fields of a packet the classifier looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Local uid that originated the packet, when known.
    pub owner_uid: Option<u32>,
}

/// Condition a rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Source or destination port equals the value.
    Port(u16),
    /// Either endpoint is a loopback address.
    Loopback,
    /// DNS traffic in either direction.
    NameResolution,
    /// Either endpoint equals the address.
    Address(IpAddr),
    /// Originated by the local uid.
    Owner(u32),
    /// Matches every packet.
    Any,
}

impl Predicate {
    pub fn matches(&self, packet: &PacketMeta) -> bool {
        match *self {
            Self::Port(port) => packet.src_port == port || packet.dst_port == port,
            Self::Loopback => packet.src.is_loopback() || packet.dst.is_loopback(),
            Self::NameResolution => {
                matches!(packet.protocol, Protocol::Tcp | Protocol::Udp)
                    && (packet.src_port == DNS_PORT || packet.dst_port == DNS_PORT)
            }
            Self::Address(addr) => packet.src == addr || packet.dst == addr,
            Self::Owner(uid) => packet.owner_uid == Some(uid),
            Self::Any => true,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(p) => write!(f, "port {p}"),
            Self::Loopback => f.write_str("loopback"),
            Self::NameResolution => f.write_str("name-resolution"),
            Self::Address(a) => write!(f, "address {a}"),
            Self::Owner(uid) => write!(f, "uid {uid}"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// One classifier rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub predicate: Predicate,
    pub tag: Tag,
}

impl Rule {
    pub fn protected(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
            tag: Tag::Protected,
        }
    }

    pub fn catch_all() -> Self {
        Self {
            name: "catch-all".to_string(),
            predicate: Predicate::Any,
            tag: Tag::Rotated,
        }
    }

    /// Catch-all scoped to one rotated principal.
    pub fn rotated_owner(uid: u32) -> Self {
        Self {
            name: format!("rotated-uid-{uid}"),
            predicate: Predicate::Owner(uid),
            tag: Tag::Rotated,
        }
    }

    pub const fn is_catch_all(&self) -> bool {
        matches!(self.tag, Tag::Rotated)
            && matches!(self.predicate, Predicate::Any | Predicate::Owner(_))
    }
}

/// Classifier policy violations. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifierError {
    #[error("protected path leak: {0}")]
    ProtectedPathLeak(String),

    #[error("rotated rule '{rule}' can never match: protected rule '{shadow}' has the same predicate")]
    UnreachableRotated { rule: String, shadow: String },
}

/// Ordered, first-match-wins packet classifier.
#[derive(Debug, Clone)]
pub struct TrafficClassifier {
    rules: Vec<Rule>,
}

impl TrafficClassifier {
    /// Build a classifier from an explicit rule list, rejecting any ordering
    /// that could route a protected flow into the tunnel.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ClassifierError> {
        let classifier = Self { rules };
        classifier.validate()?;
        Ok(classifier)
    }

    /// Build the standard policy from configuration.
    ///
    /// `session_address` is the operator address detected from the launching
    /// session; an address in the config takes precedence. `transport_uid`
    /// owns the tunnel transport processes and the egress probes, whose
    /// packets must reach the tunnel servers over the host's own path.
    pub fn from_config(
        config: &ClassifierConfig,
        session_address: Option<IpAddr>,
        transport_uid: u32,
    ) -> Result<Self, ClassifierError> {
        let mut rules = vec![
            Rule::protected("operator-session", Predicate::Port(config.operator_port)),
        ];
        if let Some(port) = config.admin_port {
            rules.push(Rule::protected("admin-panel", Predicate::Port(port)));
        }
        rules.push(Rule::protected("loopback", Predicate::Loopback));
        rules.push(Rule::protected("name-resolution", Predicate::NameResolution));
        if let Some(addr) = config.operator_address.or(session_address) {
            rules.push(Rule::protected("operator-address", Predicate::Address(addr)));
        }
        rules.push(Rule::protected("tunnel-transport", Predicate::Owner(transport_uid)));
        for uid in config.protected_uids.iter().filter(|uid| **uid != transport_uid) {
            rules.push(Rule::protected(format!("uid-{uid}"), Predicate::Owner(*uid)));
        }
        if config.rotated_uids.is_empty() {
            rules.push(Rule::catch_all());
        } else {
            rules.extend(config.rotated_uids.iter().map(|uid| Rule::rotated_owner(*uid)));
        }
        Self::new(rules)
    }

    /// Check the structural invariants of the rule list.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let Some(last) = self.rules.last() else {
            return Err(ClassifierError::ProtectedPathLeak(
                "rule list is empty".to_string(),
            ));
        };
        if !last.is_catch_all() {
            return Err(ClassifierError::ProtectedPathLeak(format!(
                "last rule '{}' is not a rotated catch-all",
                last.name
            )));
        }

        let mut seen_rotated: Option<&Rule> = None;
        for rule in &self.rules {
            match rule.tag {
                Tag::Rotated => {
                    seen_rotated.get_or_insert(rule);
                    if let Some(shadow) = self
                        .rules
                        .iter()
                        .take_while(|r| r.tag == Tag::Protected)
                        .find(|r| r.predicate == rule.predicate)
                    {
                        return Err(ClassifierError::UnreachableRotated {
                            rule: rule.name.clone(),
                            shadow: shadow.name.clone(),
                        });
                    }
                }
                Tag::Protected => {
                    if let Some(shadow) = seen_rotated {
                        return Err(ClassifierError::ProtectedPathLeak(format!(
                            "protected rule '{}' ({}) is shadowed by rotated rule '{}'",
                            rule.name, rule.predicate, shadow.name
                        )));
                    }
                    if rule.predicate == Predicate::Any {
                        return Err(ClassifierError::ProtectedPathLeak(format!(
                            "protected rule '{}' matches everything",
                            rule.name
                        )));
                    }
                }
            }
        }

        for required in [Predicate::Loopback, Predicate::NameResolution] {
            let present = self
                .rules
                .iter()
                .any(|r| r.tag == Tag::Protected && r.predicate == required);
            if !present {
                return Err(ClassifierError::ProtectedPathLeak(format!(
                    "no protected rule for {required}"
                )));
            }
        }
        let protects = |f: fn(&Predicate) -> bool| {
            self.rules
                .iter()
                .any(|r| r.tag == Tag::Protected && f(&r.predicate))
        };
        if !protects(|p| matches!(p, Predicate::Port(_))) {
            return Err(ClassifierError::ProtectedPathLeak(
                "no protected rule for the operator session port".to_string(),
            ));
        }
        if !protects(|p| matches!(p, Predicate::Owner(_))) {
            return Err(ClassifierError::ProtectedPathLeak(
                "no protected rule for the tunnel transport's principal".to_string(),
            ));
        }
        Ok(())
    }

    /// Tag a packet. The first matching rule wins; an unmatched packet is
    /// never marked.
    pub fn classify(&self, packet: &PacketMeta) -> Tag {
        self.rules
            .iter()
            .find(|r| r.predicate.matches(packet))
            .map_or(Tag::Protected, |r| r.tag)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Render the rules as iptables mangle arguments, one vector per rule,
    /// to be appended to `chain` in order.
    ///
    /// Protected rules `RETURN` (leaving the packet unmarked, on the main
    /// table); rotated rules set `fwmark`. IPv6 address rules are skipped:
    /// this chain lives in the IPv4 table.
    pub fn iptables_rules(&self, chain: &str, fwmark: u32) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for rule in &self.rules {
            let target: Vec<String> = match rule.tag {
                Tag::Protected => vec!["-j".into(), "RETURN".into()],
                Tag::Rotated => vec![
                    "-j".into(),
                    "MARK".into(),
                    "--set-mark".into(),
                    fwmark.to_string(),
                ],
            };
            for matcher in matchers(&rule.predicate) {
                let mut args = vec![
                    "-t".to_string(),
                    "mangle".to_string(),
                    "-A".to_string(),
                    chain.to_string(),
                ];
                args.extend(matcher);
                args.extend(target.iter().cloned());
                out.push(args);
            }
        }
        out
    }
}

fn port_matchers(port: u16) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    for proto in ["tcp", "udp"] {
        for flag in ["--sport", "--dport"] {
            out.push(vec![
                "-p".to_string(),
                proto.to_string(),
                flag.to_string(),
                port.to_string(),
            ]);
        }
    }
    out
}

fn matchers(predicate: &Predicate) -> Vec<Vec<String>> {
    match predicate {
        Predicate::Port(port) => port_matchers(*port),
        Predicate::NameResolution => port_matchers(DNS_PORT),
        Predicate::Loopback => vec![
            vec!["-o".into(), "lo".into()],
            vec!["-d".into(), "127.0.0.0/8".into()],
        ],
        Predicate::Address(IpAddr::V4(addr)) => vec![
            vec!["-d".into(), addr.to_string()],
            vec!["-s".into(), addr.to_string()],
        ],
        Predicate::Address(IpAddr::V6(_)) => Vec::new(),
        Predicate::Owner(uid) => vec![vec![
            "-m".into(),
            "owner".into(),
            "--uid-owner".into(),
            uid.to_string(),
        ]],
        Predicate::Any => vec![Vec::new()],
    }
}

/// Operator address of the SSH session this process was launched from.
///
/// Reads `SSH_CONNECTION` (`client_ip client_port server_ip server_port`),
/// then `SSH_CLIENT` (`client_ip client_port server_port`).
pub fn session_address_from_env() -> Option<IpAddr> {
    ["SSH_CONNECTION", "SSH_CLIENT"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find_map(|val| parse_session_address(&val))
}

fn parse_session_address(value: &str) -> Option<IpAddr> {
    value.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn packet(src: &str, sport: u16, dst: &str, dport: u16) -> PacketMeta {
        PacketMeta {
            src: src.parse().unwrap(),
            src_port: sport,
            dst: dst.parse().unwrap(),
            dst_port: dport,
            protocol: Protocol::Tcp,
            owner_uid: None,
        }
    }

    /// Uid the daemon and its tunnel processes run as.
    const ROOT: u32 = 0;

    fn standard() -> TrafficClassifier {
        let config = ClassifierConfig {
            admin_port: Some(8443),
            operator_address: Some("198.51.100.20".parse().unwrap()),
            ..ClassifierConfig::default()
        };
        TrafficClassifier::from_config(&config, None, ROOT).unwrap()
    }

    /// The minimal hand-built list `validate` accepts, minus the catch-all.
    fn required_protected() -> Vec<Rule> {
        vec![
            Rule::protected("operator-session", Predicate::Port(22)),
            Rule::protected("loopback", Predicate::Loopback),
            Rule::protected("name-resolution", Predicate::NameResolution),
            Rule::protected("tunnel-transport", Predicate::Owner(ROOT)),
        ]
    }

    #[test]
    fn operator_port_is_protected_in_both_directions() {
        let c = standard();
        assert_eq!(c.classify(&packet("10.0.0.5", 22, "203.0.113.9", 51000)), Tag::Protected);
        assert_eq!(c.classify(&packet("10.0.0.5", 51000, "203.0.113.9", 22)), Tag::Protected);
    }

    #[test]
    fn admin_panel_port_is_protected() {
        let c = standard();
        assert_eq!(c.classify(&packet("10.0.0.5", 8443, "203.0.113.9", 40000)), Tag::Protected);
    }

    #[test]
    fn loopback_and_dns_are_protected() {
        let c = standard();
        assert_eq!(c.classify(&packet("127.0.0.1", 4000, "127.0.0.1", 5432)), Tag::Protected);
        let mut dns = packet("10.0.0.5", 40000, "9.9.9.9", 53);
        dns.protocol = Protocol::Udp;
        assert_eq!(c.classify(&dns), Tag::Protected);
    }

    #[test]
    fn operator_address_is_protected_on_any_port() {
        let c = standard();
        assert_eq!(
            c.classify(&packet("10.0.0.5", 40000, "198.51.100.20", 443)),
            Tag::Protected
        );
        assert_eq!(
            c.classify(&packet("198.51.100.20", 443, "10.0.0.5", 40000)),
            Tag::Protected
        );
    }

    #[test]
    fn everything_else_is_rotated() {
        let c = standard();
        assert_eq!(c.classify(&packet("10.0.0.5", 40000, "93.184.216.34", 443)), Tag::Rotated);
    }

    #[test]
    fn packet_matching_protected_and_catch_all_is_protected() {
        let c = standard();
        // Matches the operator-session rule and the catch-all.
        let p = packet("10.0.0.5", 22, "93.184.216.34", 443);
        assert!(Predicate::Any.matches(&p));
        assert_eq!(c.classify(&p), Tag::Protected);
    }

    #[test]
    fn protected_uid_is_protected() {
        let config = ClassifierConfig {
            protected_uids: vec![1001],
            ..ClassifierConfig::default()
        };
        let c = TrafficClassifier::from_config(&config, None, ROOT).unwrap();
        let mut p = packet("10.0.0.5", 40000, "93.184.216.34", 443);
        p.owner_uid = Some(1001);
        assert_eq!(c.classify(&p), Tag::Protected);
        p.owner_uid = Some(1002);
        assert_eq!(c.classify(&p), Tag::Rotated);
    }

    #[test]
    fn session_address_used_when_config_has_none() {
        let c = TrafficClassifier::from_config(
            &ClassifierConfig::default(),
            Some("192.0.2.44".parse().unwrap()),
            ROOT,
        )
        .unwrap();
        assert_eq!(c.classify(&packet("10.0.0.5", 40000, "192.0.2.44", 443)), Tag::Protected);
    }

    #[test]
    fn tunnel_transport_traffic_is_not_rotated() {
        let c = TrafficClassifier::from_config(&ClassifierConfig::default(), None, ROOT).unwrap();
        let mut to_server = packet("10.0.0.5", 41000, "185.65.134.1", 1194);
        to_server.protocol = Protocol::Udp;
        to_server.owner_uid = Some(ROOT);
        assert_eq!(c.classify(&to_server), Tag::Protected);

        to_server.owner_uid = Some(1001);
        assert_eq!(c.classify(&to_server), Tag::Rotated);
    }

    #[test]
    fn rotated_uids_scope_the_catch_all() {
        let config = ClassifierConfig {
            rotated_uids: vec![1001],
            ..ClassifierConfig::default()
        };
        let c = TrafficClassifier::from_config(&config, None, ROOT).unwrap();
        let mut p = packet("10.0.0.5", 40000, "93.184.216.34", 443);
        p.owner_uid = Some(1001);
        assert_eq!(c.classify(&p), Tag::Rotated);
        p.owner_uid = Some(1002);
        assert_eq!(c.classify(&p), Tag::Protected);
        p.owner_uid = None;
        assert_eq!(c.classify(&p), Tag::Protected);

        let rendered = c.iptables_rules("TUNROT", 100);
        assert_eq!(
            rendered.last().unwrap(),
            &[
                "-t", "mangle", "-A", "TUNROT", "-m", "owner", "--uid-owner", "1001", "-j",
                "MARK", "--set-mark", "100"
            ]
        );
    }

    #[test]
    fn rotating_the_transport_uid_is_rejected() {
        let config = ClassifierConfig {
            rotated_uids: vec![ROOT],
            ..ClassifierConfig::default()
        };
        assert!(matches!(
            TrafficClassifier::from_config(&config, None, ROOT),
            Err(ClassifierError::UnreachableRotated { .. })
        ));
    }

    #[test]
    fn catch_all_before_protected_rule_is_leak() {
        let mut rules = required_protected();
        let port = rules.remove(0);
        rules.push(Rule::catch_all());
        rules.push(port);
        assert!(matches!(
            TrafficClassifier::new(rules),
            Err(ClassifierError::ProtectedPathLeak(_))
        ));
    }

    #[test]
    fn rotated_rule_shadowing_protected_rule_is_leak() {
        let rules = vec![
            Rule::protected("operator-session", Predicate::Port(22)),
            Rule::protected("loopback", Predicate::Loopback),
            Rule {
                name: "web".into(),
                predicate: Predicate::Port(443),
                tag: Tag::Rotated,
            },
            Rule::protected("name-resolution", Predicate::NameResolution),
            Rule::protected("tunnel-transport", Predicate::Owner(ROOT)),
            Rule::catch_all(),
        ];
        let err = TrafficClassifier::new(rules).unwrap_err();
        assert!(err.to_string().contains("shadowed"));
    }

    #[test]
    fn minimal_rule_list_is_accepted() {
        let mut rules = required_protected();
        rules.push(Rule::catch_all());
        assert!(TrafficClassifier::new(rules).is_ok());
    }

    #[test]
    fn missing_catch_all_is_leak() {
        assert!(TrafficClassifier::new(required_protected()).is_err());
        assert!(TrafficClassifier::new(Vec::new()).is_err());
    }

    #[test]
    fn missing_dns_rule_is_leak() {
        let mut rules = required_protected();
        rules.retain(|r| r.predicate != Predicate::NameResolution);
        rules.push(Rule::catch_all());
        let err = TrafficClassifier::new(rules).unwrap_err();
        assert!(err.to_string().contains("name-resolution"));
    }

    #[test]
    fn missing_operator_port_rule_is_leak() {
        let mut rules = required_protected();
        rules.retain(|r| !matches!(r.predicate, Predicate::Port(_)));
        rules.push(Rule::catch_all());
        let err = TrafficClassifier::new(rules).unwrap_err();
        assert!(matches!(err, ClassifierError::ProtectedPathLeak(_)));
        assert!(err.to_string().contains("operator session port"));
    }

    #[test]
    fn missing_transport_principal_rule_is_leak() {
        let mut rules = required_protected();
        rules.retain(|r| !matches!(r.predicate, Predicate::Owner(_)));
        rules.push(Rule::catch_all());
        let err = TrafficClassifier::new(rules).unwrap_err();
        assert!(err.to_string().contains("tunnel transport"));
    }

    #[test]
    fn iptables_rules_keep_order_and_end_with_mark() {
        let c = standard();
        let rendered = c.iptables_rules("TUNROT", 100);
        let first = rendered.first().unwrap();
        assert_eq!(&first[..4], ["-t", "mangle", "-A", "TUNROT"]);
        assert!(first.contains(&"22".to_string()));
        assert!(first.ends_with(&["-j".to_string(), "RETURN".to_string()]));

        let last = rendered.last().unwrap();
        assert_eq!(
            last,
            &["-t", "mangle", "-A", "TUNROT", "-j", "MARK", "--set-mark", "100"]
        );
        let marks = rendered.iter().filter(|r| r.contains(&"MARK".to_string())).count();
        assert_eq!(marks, 1);
    }

    #[test]
    fn parses_ssh_connection_value() {
        assert_eq!(
            parse_session_address("203.0.113.7 51514 10.0.0.5 22"),
            Some("203.0.113.7".parse().unwrap())
        );
        assert_eq!(parse_session_address(""), None);
        assert_eq!(parse_session_address("garbage 1 2"), None);
    }
}
