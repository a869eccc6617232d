use crate::memory::Memory;
use crate::patcher::Patch;
use log::{debug, error, trace};
use std::collections::BTreeMap;

/// PatchGroup applies and reverts a named set of patches together.
///
/// The group refers to its members by key; the patches themselves live in the
/// table handed to `apply_all` and `revert_all`. After more than `max_attempts`
/// consecutive failed applications the group stops touching memory until a
/// revert brings it back to a clean state.
#[derive(Clone, Debug)]
pub struct PatchGroup<K> {
    name: String,
    members: Vec<K>,
    applied: usize,
    attempts: u32,
    max_attempts: u32,
}
impl<K: Ord + std::fmt::Debug> PatchGroup<K> {
    pub fn new(name: &str, members: Vec<K>, max_attempts: u32) -> Self {
        PatchGroup {
            name: name.to_string(),
            members,
            applied: 0,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[K] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Number of members currently applied, as of the last apply or revert.
    pub fn applied_count(&self) -> usize {
        self.applied
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// is_disabled tells whether `apply_all` gave up on this group.
    pub fn is_disabled(&self) -> bool {
        self.attempts > self.max_attempts
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    fn count_applied(&self, patches: &BTreeMap<K, Patch>) -> usize {
        self.members
            .iter()
            .filter(|key| patches.get(*key).map_or(false, Patch::is_applied))
            .count()
    }

    /// apply_all patches every member. Returns true when all members are applied.
    pub fn apply_all<M: Memory + ?Sized>(
        &mut self,
        patches: &mut BTreeMap<K, Patch>,
        memory: &mut M,
    ) -> bool {
        if self.is_disabled() {
            trace!("[Patch] [{}] Patching disabled", self.name);
            return false;
        }

        debug!("[Patch] [{}] Patching", self.name);

        if self.applied == self.size() {
            debug!("[Patch] [{}] Already patched", self.name);
            return true;
        }

        for key in &self.members {
            match patches.get_mut(key) {
                Some(patch) => {
                    patch.patch(memory);
                }
                None => error!("[Patch] [{}] Unknown member {:?}", self.name, key),
            }
        }
        self.applied = self.count_applied(patches);

        if self.applied == self.size() {
            debug!("[Patch] [{}] Patch success", self.name);
            self.attempts = 0;
            return true;
        }
        error!(
            "[Patch] [{}] Patching failed ({}/{} applied)",
            self.name,
            self.applied,
            self.size()
        );
        self.attempts += 1;

        if self.is_disabled() {
            error!("[Patch] [{}] Patch attempt limit exceeded", self.name);
            error!("[Patch] [{}] Patching disabled", self.name);
        }
        false
    }

    /// revert_all restores every member, regardless of the attempt ceiling.
    /// Returns true when no member is left applied.
    pub fn revert_all<M: Memory + ?Sized>(
        &mut self,
        patches: &mut BTreeMap<K, Patch>,
        memory: &mut M,
    ) -> bool {
        debug!("[Patch] [{}] Restoring instructions", self.name);

        let mut restored = 0;
        for key in &self.members {
            if let Some(patch) = patches.get_mut(key) {
                if patch.restore(memory) {
                    restored += 1;
                }
            }
        }
        self.applied = self.count_applied(patches);

        if self.applied == 0 {
            if restored == 0 {
                debug!("[Patch] [{}] Already restored/intact", self.name);
            } else {
                debug!("[Patch] [{}] Restore success", self.name);
                self.attempts = 0;
            }
            return true;
        }
        error!(
            "[Patch] [{}] Restore failed ({}/{} still applied)",
            self.name,
            self.applied,
            self.size()
        );
        false
    }
}
