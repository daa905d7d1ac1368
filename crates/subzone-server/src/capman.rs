// capman.rs — group resolution and capability queries
//
// Groups live in staff.conf (section per arena base name, plus the
// (global) section); capabilities per group live in groupdef.conf. An
// unauthenticated player is always "default" no matter what the files say.

use subzone_common::conf::ConfDocument;

use crate::server::GroupSource;

pub const GLOBAL_SECTION: &str = "(global)";
pub const GROUP_PASSWORD_SECTION: &str = "GroupPasswords";
pub const DEFAULT_GROUP: &str = "default";

/// Capability names the core itself consults.
pub const CAP_SEE_MOD_CHAT: &str = "seemodchat";
pub const CAP_REBROADCAST_LVZ: &str = "rebroadcastlvz";
pub const CAP_REBROADCAST_ANY: &str = "rebroadcastany";

pub struct CapabilityStore {
    pub staff: ConfDocument,
    pub groupdef: ConfDocument,
}

impl CapabilityStore {
    pub fn new(staff: ConfDocument, groupdef: ConfDocument) -> Self {
        Self { staff, groupdef }
    }

    /// Resolve a player's group. `arena_cfg` is the arena's own config,
    /// consulted for a [Staff] section between the arena and global tables.
    pub fn resolve_group(
        &self,
        name: &str,
        authenticated: bool,
        arena_base: Option<&str>,
        arena_cfg: Option<&ConfDocument>,
    ) -> (String, GroupSource) {
        if !authenticated {
            return (DEFAULT_GROUP.to_string(), GroupSource::Default);
        }
        if let Some(base) = arena_base {
            if let Some(group) = self.staff.get_str(base, name) {
                if !group.is_empty() {
                    return (group.to_string(), GroupSource::Arena);
                }
            }
            if let Some(cfg) = arena_cfg {
                if let Some(group) = cfg.get_str("Staff", name) {
                    if !group.is_empty() {
                        return (group.to_string(), GroupSource::ArenaList);
                    }
                }
            }
        }
        if let Some(group) = self.staff.get_str(GLOBAL_SECTION, name) {
            if !group.is_empty() {
                return (group.to_string(), GroupSource::Global);
            }
        }
        (DEFAULT_GROUP.to_string(), GroupSource::Default)
    }

    /// True iff the capability key is present (any non-empty value) for the
    /// group.
    pub fn has_capability(&self, group: &str, cap: &str) -> bool {
        self.groupdef.get_str(group, cap).is_some()
    }

    pub fn is_higher_than(&self, group_a: &str, group_b: &str) -> bool {
        let key = format!("higher_than_{}", group_b);
        self.has_capability(group_a, &key)
    }

    pub fn check_group_password(&self, group: &str, password: &str) -> bool {
        self.staff
            .get_str(GROUP_PASSWORD_SECTION, group)
            .map(|pw| pw == password)
            .unwrap_or(false)
    }

    /// Persist a group change; global scope writes to the (global) section,
    /// otherwise to the arena base section. The document is flushed by the
    /// periodic save pass.
    pub fn set_permanent_group(&mut self, scope_global: bool, arena_base: &str, name: &str, group: &str) {
        let section = if scope_global { GLOBAL_SECTION } else { arena_base };
        self.staff.set_str(section, name, group);
    }

    pub fn remove_permanent_group(&mut self, scope_global: bool, arena_base: &str, name: &str) {
        let section = if scope_global { GLOBAL_SECTION } else { arena_base };
        self.staff.remove_key(section, name);
    }
}
