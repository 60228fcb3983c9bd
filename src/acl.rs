//! Share access-control rules.
//!
//! An ACL is an ordered rule list plus a default level. Rules are evaluated
//! in order against the session's attributes; every rule answers
//! [`Decision::Default`] or a concrete level, and the last concrete answer
//! wins. When no rule speaks, the list's default level applies. The same
//! engine drives share-list visibility filtering.

use std::net::IpAddr;

/// What a single rule (or the whole evaluation) grants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Decision {
    /// The rule does not apply to this session.
    Default,
    NoAccess,
    Read,
    ReadWrite,
}

/// Transport protocol a session arrived over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Smb,
    Nfs,
    Ftp,
}

/// Session attributes the rules match against.
#[derive(Debug, Clone)]
pub struct AccessSubject {
    pub user: String,
    pub domain: String,
    pub protocol: Protocol,
    pub address: IpAddr,
    pub unix_uid: Option<u32>,
    pub unix_gids: Vec<u32>,
}

/// What a rule keys on.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Account name, case-insensitive.
    User(String),
    /// Authentication domain, case-insensitive.
    Domain(String),
    Protocol(Protocol),
    /// Address within `network/prefix_len`.
    Address { network: IpAddr, prefix_len: u8 },
    UnixUid(u32),
    UnixGid(u32),
}

/// One ordered rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: Matcher,
    pub level: Decision,
    /// Grants the per-session admin capability when the rule matches.
    pub admin: bool,
}

impl Rule {
    pub fn new(matcher: Matcher, level: Decision) -> Rule {
        Rule { matcher, level, admin: false }
    }

    pub fn with_admin(matcher: Matcher, level: Decision) -> Rule {
        Rule { matcher, level, admin: true }
    }

    fn applies(&self, subject: &AccessSubject) -> bool {
        match &self.matcher {
            Matcher::User(name) => subject.user.eq_ignore_ascii_case(name),
            Matcher::Domain(name) => subject.domain.eq_ignore_ascii_case(name),
            Matcher::Protocol(protocol) => subject.protocol == *protocol,
            Matcher::Address { network, prefix_len } => {
                address_in(subject.address, *network, *prefix_len)
            }
            Matcher::UnixUid(uid) => subject.unix_uid == Some(*uid),
            Matcher::UnixGid(gid) => subject.unix_gids.contains(gid),
        }
    }
}

fn address_in(address: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    fn prefix_match(a: &[u8], b: &[u8], prefix_len: u8) -> bool {
        let full = prefix_len as usize / 8;
        let rest = prefix_len as usize % 8;
        if a[..full] != b[..full] {
            return false;
        }
        if rest == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rest);
        (a[full] & mask) == (b[full] & mask)
    }
    match (address, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) => prefix_match(&a.octets(), &n.octets(), prefix_len.min(32)),
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            prefix_match(&a.octets(), &n.octets(), prefix_len.min(128))
        }
        _ => false,
    }
}

/// The outcome of evaluating a whole list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub level: Decision,
    pub admin: bool,
}

/// Ordered rule list with a default level.
#[derive(Debug, Clone)]
pub struct Acl {
    rules: Vec<Rule>,
    default_level: Decision,
}

impl Acl {
    pub fn new(rules: Vec<Rule>, default_level: Decision) -> Acl {
        debug_assert_ne!(default_level, Decision::Default);
        Acl { rules, default_level }
    }

    /// Everyone gets read-write; the open-share default.
    pub fn open() -> Acl {
        Acl { rules: Vec::new(), default_level: Decision::ReadWrite }
    }

    /// Nobody gets in unless a rule says so.
    pub fn closed(rules: Vec<Rule>) -> Acl {
        Acl { rules, default_level: Decision::NoAccess }
    }

    /// Evaluates the list: the last non-default rule decides both the level
    /// and the admin capability, and admin never survives a denied level.
    pub fn evaluate(&self, subject: &AccessSubject) -> Verdict {
        let mut level = Decision::Default;
        let mut admin = false;
        for rule in &self.rules {
            if !rule.applies(subject) || rule.level == Decision::Default {
                continue;
            }
            level = rule.level;
            admin = rule.admin;
        }
        let level = if level == Decision::Default { self.default_level } else { level };
        Verdict { level, admin: admin && level != Decision::NoAccess }
    }

    /// Visibility for share enumeration: anything better than `NoAccess`.
    pub fn visible(&self, subject: &AccessSubject) -> bool {
        self.evaluate(subject).level > Decision::NoAccess
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(user: &str, address: [u8; 4]) -> AccessSubject {
        AccessSubject {
            user: user.to_string(),
            domain: "WORKGROUP".to_string(),
            protocol: Protocol::Smb,
            address: IpAddr::from(address),
            unix_uid: None,
            unix_gids: Vec::new(),
        }
    }

    #[test]
    fn default_level_applies_when_no_rule_matches() {
        let acl = Acl::new(
            vec![Rule::new(Matcher::User("alice".into()), Decision::ReadWrite)],
            Decision::Read,
        );
        assert_eq!(acl.evaluate(&subject("bob", [10, 0, 0, 1])).level, Decision::Read);
    }

    #[test]
    fn last_matching_rule_wins() {
        let acl = Acl::new(
            vec![
                Rule::new(Matcher::Protocol(Protocol::Smb), Decision::ReadWrite),
                Rule::new(Matcher::User("guest".into()), Decision::Read),
            ],
            Decision::NoAccess,
        );
        assert_eq!(acl.evaluate(&subject("guest", [10, 0, 0, 1])).level, Decision::Read);
        assert_eq!(acl.evaluate(&subject("alice", [10, 0, 0, 1])).level, Decision::ReadWrite);
    }

    #[test]
    fn subnet_rule() {
        let acl = Acl::closed(vec![Rule::new(
            Matcher::Address { network: IpAddr::from([192, 168, 1, 0]), prefix_len: 24 },
            Decision::ReadWrite,
        )]);
        assert_eq!(acl.evaluate(&subject("x", [192, 168, 1, 77])).level, Decision::ReadWrite);
        assert_eq!(acl.evaluate(&subject("x", [192, 168, 2, 1])).level, Decision::NoAccess);
    }

    #[test]
    fn admin_requires_access() {
        let acl = Acl::new(
            vec![
                Rule::with_admin(Matcher::User("ops".into()), Decision::ReadWrite),
                Rule::new(Matcher::Protocol(Protocol::Smb), Decision::NoAccess),
            ],
            Decision::Read,
        );
        // later no-access rule both demotes the level and voids admin
        let verdict = acl.evaluate(&subject("ops", [10, 0, 0, 1]));
        assert_eq!(verdict, Verdict { level: Decision::NoAccess, admin: false });
    }

    #[test]
    fn visibility_tracks_level() {
        let acl = Acl::closed(vec![Rule::new(Matcher::User("alice".into()), Decision::Read)]);
        assert!(acl.visible(&subject("alice", [1, 1, 1, 1])));
        assert!(!acl.visible(&subject("bob", [1, 1, 1, 1])));
    }

    #[test]
    fn uid_and_gid_rules() {
        let mut who = subject("nfsuser", [10, 0, 0, 2]);
        who.unix_uid = Some(1000);
        who.unix_gids = vec![10, 100];
        let acl = Acl::closed(vec![
            Rule::new(Matcher::UnixUid(1000), Decision::Read),
            Rule::new(Matcher::UnixGid(100), Decision::ReadWrite),
        ]);
        assert_eq!(acl.evaluate(&who).level, Decision::ReadWrite);
    }
}
