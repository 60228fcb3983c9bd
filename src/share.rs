//! Named exports --- [`Share`] and the [`ShareRegistry`].

use std::sync::Arc;
use std::time::SystemTime;

use crate::acl::{Acl, AccessSubject, Decision, Verdict};
use crate::disk::Disk;
use crate::state::FileStateCache;

/// What kind of resource a share exports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShareKind {
    Disk,
    Ipc,
    Printer,
}

impl ShareKind {
    /// Service string carried in tree-connect requests and replies.
    pub fn service(self) -> &'static str {
        match self {
            ShareKind::Disk => "A:",
            ShareKind::Ipc => "IPC",
            ShareKind::Printer => "LPT1:",
        }
    }
}

/// Volume metadata surfaced by filesystem-information queries.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub label: String,
    pub serial: u32,
    pub created: SystemTime,
}

impl Default for VolumeInfo {
    fn default() -> Self {
        VolumeInfo { label: "SMBSERVE".to_string(), serial: 0x5342_5356, created: SystemTime::now() }
    }
}

/// One named export.
pub struct Share {
    /// Dense id assigned by the registry; part of every state-cache key.
    pub id: u16,
    /// Canonical (uppercase) share name.
    pub name: String,
    pub kind: ShareKind,
    pub comment: String,
    pub disk: Arc<dyn Disk>,
    pub acl: Acl,
    pub volume: VolumeInfo,
    pub cache: Arc<dyn FileStateCache>,
    /// Whether change-notification requests on this share are honored.
    pub notify_enabled: bool,
}

impl Share {
    pub fn is_ipc(&self) -> bool {
        self.kind == ShareKind::Ipc
    }
}

/// The immutable set of shares a server exports. Built once at start-up.
pub struct ShareRegistry {
    shares: Vec<Arc<Share>>,
}

impl ShareRegistry {
    pub fn new() -> ShareRegistry {
        ShareRegistry { shares: Vec::new() }
    }

    /// Registers a share; the name is folded to its canonical uppercase
    /// form and must be unique.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        name: &str,
        kind: ShareKind,
        comment: &str,
        disk: Arc<dyn Disk>,
        acl: Acl,
        volume: VolumeInfo,
        cache: Arc<dyn FileStateCache>,
    ) -> Arc<Share> {
        let canonical = name.to_ascii_uppercase();
        debug_assert!(self.find(&canonical).is_none(), "duplicate share {canonical}");
        let share = Arc::new(Share {
            id: self.shares.len() as u16,
            name: canonical,
            kind,
            comment: comment.to_string(),
            disk,
            acl,
            volume,
            cache,
            notify_enabled: kind == ShareKind::Disk,
        });
        self.shares.push(Arc::clone(&share));
        share
    }

    /// Case-insensitive lookup.
    pub fn find(&self, name: &str) -> Option<Arc<Share>> {
        self.shares.iter().find(|s| s.name.eq_ignore_ascii_case(name)).cloned()
    }

    pub fn all(&self) -> &[Arc<Share>] {
        &self.shares
    }
}

impl Default for ShareRegistry {
    fn default() -> Self {
        ShareRegistry::new()
    }
}

/// Pluggable access-control seam consulted at tree connect and share
/// enumeration.
pub trait AccessControl: Send + Sync {
    /// Access level for one share.
    fn check(&self, subject: &AccessSubject, share: &Share) -> Verdict;

    /// Shares the session may see at all.
    fn filter(&self, subject: &AccessSubject, shares: &[Arc<Share>]) -> Vec<Arc<Share>> {
        shares.iter().filter(|s| self.check(subject, s).level > Decision::NoAccess).cloned().collect()
    }
}

/// Default manager: evaluates each share's own rule list.
pub struct DefaultAccessControl;

impl AccessControl for DefaultAccessControl {
    fn check(&self, subject: &AccessSubject, share: &Share) -> Verdict {
        share.acl.evaluate(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Matcher, Rule};
    use crate::disk::memory::MemoryDisk;
    use crate::state::standalone::StandaloneCache;
    use std::net::IpAddr;
    use std::time::Duration;

    fn registry_with(names: &[(&str, Acl)]) -> ShareRegistry {
        let cache = StandaloneCache::new(Duration::from_secs(5));
        let mut registry = ShareRegistry::new();
        for (name, acl) in names {
            registry.add(
                name,
                ShareKind::Disk,
                "",
                Arc::new(MemoryDisk::new()),
                acl.clone(),
                VolumeInfo::default(),
                cache.clone(),
            );
        }
        registry
    }

    fn subject(user: &str) -> AccessSubject {
        AccessSubject {
            user: user.to_string(),
            domain: String::new(),
            protocol: crate::acl::Protocol::Smb,
            address: IpAddr::from([127, 0, 0, 1]),
            unix_uid: None,
            unix_gids: Vec::new(),
        }
    }

    #[test]
    fn names_fold_to_uppercase() {
        let registry = registry_with(&[("public", Acl::open())]);
        assert!(registry.find("PUBLIC").is_some());
        assert!(registry.find("Public").is_some());
        assert_eq!(registry.find("public").unwrap().name, "PUBLIC");
    }

    #[test]
    fn filter_hides_denied_shares() {
        let registry = registry_with(&[
            ("PUBLIC", Acl::open()),
            ("SECRET", Acl::closed(vec![Rule::new(
                Matcher::User("alice".into()),
                Decision::ReadWrite,
            )])),
        ]);
        let manager = DefaultAccessControl;
        let visible = manager.filter(&subject("bob"), registry.all());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "PUBLIC");

        let visible = manager.filter(&subject("alice"), registry.all());
        assert_eq!(visible.len(), 2);
    }
}
