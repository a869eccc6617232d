//! Patches for the gearbox, wheel and steering code of the host game.
//!
//! Every behavior has one definition per range of game builds. The baseline is
//! valid from build 877; later builds only list what the compiler changed.

use crate::group::PatchGroup;
use crate::memory::Memory;
use crate::patcher::{Patch, PatchDef, Replacement};
use crate::pattern::Signature;
use crate::version::VersionCascade;
use crate::Result;
use log::{error, info, warn};
use std::collections::BTreeMap;

pub const V1_0_877: u32 = 877;
pub const V1_0_1365: u32 = 1365;
pub const V1_0_1604: u32 = 1604;
pub const V1_0_2802: u32 = 2802;
pub const V1_0_3095: u32 = 3095;

/// Behavior names a piece of game logic that can be switched off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Behavior {
    /// Shift-up doesn't trigger.
    ShiftUp,
    /// Shift-down doesn't trigger.
    ShiftDown,
    /// Clutch doesn't disengage on low RPM.
    ClutchLowRpm,
    /// Clutch doesn't disengage on the rev limiter.
    ClutchRevLimit,
    /// Throttle isn't lifted during shifts.
    ThrottleLift,
    /// Drive at the wheels doesn't decrease.
    Throttle,
    /// Brake pressure doesn't decrease.
    Brake,
    /// ABS doesn't trigger.
    Abs,
    /// No countersteer assist.
    SteeringAssist,
    /// User steering input is ignored.
    SteeringControl,
    /// User throttle input is ignored.
    ThrottleControl,
}
impl Behavior {
    pub const ALL: [Behavior; 11] = [
        Behavior::ShiftUp,
        Behavior::ShiftDown,
        Behavior::ClutchLowRpm,
        Behavior::ClutchRevLimit,
        Behavior::ThrottleLift,
        Behavior::Throttle,
        Behavior::Brake,
        Behavior::Abs,
        Behavior::SteeringAssist,
        Behavior::SteeringControl,
        Behavior::ThrottleControl,
    ];

    /// Gearbox patches, in the order they are applied.
    pub const GEARBOX: [Behavior; 5] = [
        Behavior::ClutchLowRpm,
        Behavior::ClutchRevLimit,
        Behavior::ShiftDown,
        Behavior::ShiftUp,
        Behavior::ThrottleLift,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Behavior::ShiftUp => "Gears: Shift Up",
            Behavior::ShiftDown => "Gears: Shift Down",
            Behavior::ClutchLowRpm => "Gears: Clutch Low RPM",
            Behavior::ClutchRevLimit => "Gears: Clutch Rev lim",
            Behavior::ThrottleLift => "Gears: Throttle lift",
            Behavior::Throttle => "Wheel: Throttle",
            Behavior::Brake => "Wheel: Brake",
            Behavior::Abs => "Wheel: ABS",
            Behavior::SteeringAssist => "Steer: Steering assist",
            Behavior::SteeringControl => "Steer: Steering input",
            Behavior::ThrottleControl => "Throttle: Throttle control",
        }
    }

    pub fn is_gearbox(&self) -> bool {
        Behavior::GEARBOX.contains(self)
    }

    pub fn enabled_by_default(&self) -> bool {
        self.is_gearbox() || matches!(self, Behavior::SteeringAssist | Behavior::SteeringControl)
    }
}
impl std::fmt::Display for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn nop(pattern: &[u8], mask: &str, len: usize, offset: usize) -> Result<PatchDef> {
    Ok(PatchDef::new(
        Signature::new(pattern, mask, offset)?,
        Replacement::nops(len),
    ))
}

fn jmp(pattern: &[u8], mask: &str, offset: usize) -> Result<PatchDef> {
    Ok(PatchDef::new(
        Signature::new(pattern, mask, offset)?,
        Replacement::jmp_over_branch(),
    ))
}

/// gear_patterns returns the definitions of every behavior for every known build.
pub fn gear_patterns() -> Result<VersionCascade<Behavior, PatchDef>> {
    use Behavior::*;

    let baseline = vec![
        // mov [rbx],dx
        (ShiftUp, nop(b"\x66\x89\x13\xB8\x05\x00\x00\x00", "xxxxxxxx", 3, 0)?),
        (ShiftDown, nop(b"\x66\x89\x13\x89\x73\x5C", "xxxxxx", 3, 0)?),
        (
            Brake,
            nop(b"\xEB\x05\xF3\x0F\x10\x40\x78\xF3\x0F\x59\xC4\xF3", "xxxxxx?xxxxx", 8, 11)?,
        ),
        (
            Throttle,
            nop(
                b"\x0F\x28\xC3\x44\x89\x89\xC4\x01\x00\x00\x89\x81\xD0\x01\x00\x00",
                "xx?xxx??xxxx??xx",
                7,
                3,
            )?,
        ),
        (
            ClutchLowRpm,
            nop(b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x66\x44\x89\x43\x04", "xxxxxxxxxxxx", 7, 0)?,
        ),
        (
            ClutchRevLimit,
            nop(b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x44\x89\x7B\x60", "xxxxxxxxx?x", 7, 0)?,
        ),
        // je -> jmp
        (
            SteeringAssist,
            jmp(
                b"\x0F\x84\xD0\x01\x00\x00\x0F\x28\x4B\x70\xF3\x0F\x10\x25\x00\x00\x00\x00\
                  \xF3\x0F\x10\x1D\x00\x00\x00\x00\x0F\x28\xC1\x0F\x28\xD1",
                "xx????xxx?xxx?????xxx?????xx?xx?",
                0,
            )?,
        ),
        (
            SteeringControl,
            nop(
                b"\xF3\x0F\x11\x8B\xFC\x08\x00\x00\xF3\x0F\x10\x83\x00\x09\x00\x00\
                  \xF3\x0F\x58\x83\xFC\x08\x00\x00\x41\x0F\x2F\xC3\xF3\x0F\x11\x83\
                  \xFC\x08\x00\x00\x73\x06",
                "xxx???xxxxx???xxxxx???xxxxx?xxx???xxxx",
                8,
                0,
            )?,
        ),
        (
            ThrottleLift,
            nop(b"\x44\x89\x77\x50\xF3\x0F\x11\x7D\x4F", "xxxxxxxx?", 4, 0)?,
        ),
        // movss [rbx+offThrottleP],xmm6
        (
            ThrottleControl,
            nop(
                b"\x0F\x87\xA4\x00\x00\x00\xF3\x0F\x11\xB3\xBC\x09\x00\x00",
                "xx?xxxxxx???xx",
                8,
                6,
            )?,
        ),
        // or eax,[rbp+04]
        (Abs, nop(b"\x0B\x45\x04\x89\x86\x00\x02\x00\x00", "xxxxx??xx", 3, 0)?),
    ];

    VersionCascade::new(baseline)
        .tier(
            V1_0_1365,
            vec![
                (ShiftUp, nop(b"\x66\x89\x0B\x8D\x46\x04\x66\x89\x43\x04", "xx?xx?xxx?", 3, 0)?),
                (ShiftDown, nop(b"\x66\x89\x13\x44\x89\x73\x5C", "xxxxxxx", 3, 0)?),
                (
                    Brake,
                    nop(
                        b"\xEB\x05\xF3\x0F\x10\x40\x78\xF3\x41\x0F\x59\xC0\xF3",
                        "xxxxx??x?x?xx",
                        8,
                        12,
                    )?,
                ),
                (
                    Throttle,
                    nop(b"\x83\xA1\x00\x00\x00\x00\x00\x0F\x28\xC3\x89", "xx?????xxxx", 7, 0)?,
                ),
            ],
        )?
        .tier(
            V1_0_1604,
            vec![
                (ShiftDown, nop(b"\x66\x89\x13\x44\x89\x73\x68\xEB\x0A", "xxxxxx?xx", 3, 0)?),
                (
                    ClutchLowRpm,
                    nop(b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x66\x44\x89\x43\x04", "xx?xxxxxxxxx", 7, 0)?,
                ),
                (
                    ClutchRevLimit,
                    nop(
                        b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x44\x89\x6B\x6C\x44\x89\x73\x68",
                        "xx?xxxxxx??xx??",
                        7,
                        0,
                    )?,
                ),
                // test r13l,r13l precedes the je now
                (
                    SteeringAssist,
                    jmp(
                        b"\x45\x84\xED\x0F\x84\xD0\x01\x00\x00\x0F\x28\x4B\x70\
                          \xF3\x0F\x10\x25\x00\x00\x00\x00\xF3\x0F\x10\x1D\x00\x00\x00\x00\
                          \x0F\x28\xC1\x0F\x28\xD1",
                        "xxxxx????xx??xxx?????xxx?????xx?xx?",
                        3,
                    )?,
                ),
            ],
        )?
        .tier(
            V1_0_2802,
            vec![
                (ShiftUp, nop(b"\x66\x89\x0B\xB8\x05\x00\x00\x00", "xxxxxxxx", 3, 0)?),
                (ShiftDown, nop(b"\x66\x89\x13\x44\x89\x73\x68\xEB", "xxxxx?xx", 3, 0)?),
                (ClutchLowRpm, nop(b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x66", "xx?xxxxx", 7, 0)?),
                (ThrottleLift, nop(b"\x44\x89\x77\x50\xF3\x0F\x11", "xxxxxxx", 4, 0)?),
            ],
        )?
        .tier(
            V1_0_3095,
            vec![
                // add [rbx],bp
                (ShiftUp, nop(b"\x66\x01\x2B\xC7\x43\x54\xCD\xCC\xCC\x3D", "xxxxxxxxxx", 3, 0)?),
                // dec word ptr [rbx]
                (ShiftDown, nop(b"\x66\xFF\x0B\xC7\x43\x54\xCD\xCC\xCC\x3D", "xxxxxxxxxx", 3, 0)?),
                (
                    ClutchRevLimit,
                    nop(
                        b"\xC7\x43\x54\xCD\xCC\xCC\x3D\x44\x89\xB3\x84\x00\x00\x00\
                          \x44\x89\xA3\x80\x00\x00\x00",
                        "xx?xxxxxxx????xxx????",
                        7,
                        0,
                    )?,
                ),
                (ThrottleLift, nop(b"\x89\x4F\x58\xF3\x44\x0F\x11", "xx?xxxx", 3, 0)?),
            ],
        )
}

/// RegistryConfig holds the tunables of a `PatchRegistry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Consecutive failed gearbox applications tolerated before giving up.
    pub max_attempts: u32,
}
impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig { max_attempts: 4 }
    }
}

/// PatchRegistry owns every gears patch and the gearbox group.
///
/// Construct it once, call `set_patterns` with the resolved build and hand it
/// the host image on each apply or revert.
pub struct PatchRegistry {
    patterns: VersionCascade<Behavior, PatchDef>,
    patches: BTreeMap<Behavior, Patch>,
    gearbox: PatchGroup<Behavior>,
    version: Option<u32>,
}
impl PatchRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let patches = Behavior::ALL
            .iter()
            .map(|behavior| {
                (
                    *behavior,
                    Patch::new(behavior.name(), behavior.enabled_by_default()),
                )
            })
            .collect();
        Ok(PatchRegistry {
            patterns: gear_patterns()?,
            patches,
            gearbox: PatchGroup::new("Gears", Behavior::GEARBOX.to_vec(), config.max_attempts),
            version: None,
        })
    }

    /// set_patterns configures every patch for the given build. Applied patches
    /// stay applied.
    pub fn set_patterns(&mut self, version: u32) {
        info!("[Patch] Selecting patterns for version {}", version);
        for (behavior, def) in self.patterns.select(version) {
            if let Some(patch) = self.patches.get_mut(&behavior) {
                patch.configure(def);
            }
        }
        self.version = Some(version);
    }

    /// Build the patterns were last selected for.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn patch(&self, behavior: Behavior) -> Option<&Patch> {
        self.patches.get(&behavior)
    }

    pub fn gearbox(&self) -> &PatchGroup<Behavior> {
        &self.gearbox
    }

    /// test_all checks that every pattern is found, without writing.
    pub fn test_all<M: Memory + ?Sized>(&self, memory: &M) -> bool {
        self.patches
            .values()
            .fold(true, |success, patch| patch.test(memory) && success)
    }

    pub fn apply_gearbox<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        self.gearbox.apply_all(&mut self.patches, memory)
    }

    pub fn revert_gearbox<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        self.gearbox.revert_all(&mut self.patches, memory)
    }

    fn toggle(&mut self, behavior: Behavior) -> Option<&mut Patch> {
        if self.gearbox.contains(&behavior) {
            warn!("[Patch] [{}] Part of the {} group", behavior, self.gearbox.name());
            return None;
        }
        self.patches.get_mut(&behavior)
    }

    /// apply switches a single non-gearbox behavior off.
    pub fn apply<M: Memory + ?Sized>(&mut self, behavior: Behavior, memory: &mut M) -> bool {
        self.toggle(behavior)
            .map_or(false, |patch| patch.patch(memory))
    }

    /// revert switches a single non-gearbox behavior back on.
    pub fn revert<M: Memory + ?Sized>(&mut self, behavior: Behavior, memory: &mut M) -> bool {
        self.toggle(behavior)
            .map_or(false, |patch| patch.restore(memory))
    }

    /// apply_defaults applies the gearbox group and every toggle enabled by
    /// default. Returns true when all of them are applied.
    pub fn apply_defaults<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        let mut success = self.apply_gearbox(memory);
        for behavior in Behavior::ALL.iter() {
            if behavior.is_gearbox() || !behavior.enabled_by_default() {
                continue;
            }
            self.apply(*behavior, memory);
            success &= self.patches.get(behavior).map_or(false, Patch::is_applied);
        }
        success
    }

    /// shutdown restores everything before the host unloads us.
    pub fn shutdown<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        info!("[Patch] Init shutdown");
        let mut clean = self.revert_gearbox(memory);
        for behavior in Behavior::ALL.iter() {
            if behavior.is_gearbox() {
                continue;
            }
            self.revert(*behavior, memory);
            clean &= !self.patches.get(behavior).map_or(false, Patch::is_applied);
        }
        if clean {
            info!("[Patch] Shut down cleanly");
        } else {
            error!("[Patch] Shut down with unrestored patches!");
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Byte;

    fn select_for(version: u32) -> BTreeMap<Behavior, PatchDef> {
        gear_patterns().unwrap().select(version)
    }

    fn first_bytes(def: &PatchDef, count: usize) -> Vec<Byte> {
        def.signature.bytes()[..count].to_vec()
    }

    #[test]
    fn test_tables_are_valid() {
        let patterns = gear_patterns().unwrap();
        let thresholds: Vec<u32> = patterns.tiers().iter().map(|tier| tier.threshold).collect();
        assert_eq!(thresholds, vec![1365, 1604, 2802, 3095]);
    }

    #[test]
    fn test_every_behavior_has_a_definition() {
        for version in [0, 877, 1365, 1604, 2060, 2802, 2900, 3095, 3200] {
            let selected = select_for(version);
            assert_eq!(selected.len(), Behavior::ALL.len());
            for behavior in Behavior::ALL.iter() {
                assert!(selected.contains_key(behavior));
            }
        }
    }

    #[test]
    fn test_selection_between_tiers() {
        let selected = select_for(2900);
        let expected = Signature::new(b"\x66\x89\x0B\xB8\x05\x00\x00\x00", "xxxxxxxx", 0).unwrap();
        assert_eq!(selected[&Behavior::ShiftUp].signature, expected);
        let expected = Signature::new(
            b"\xC7\x43\x40\xCD\xCC\xCC\x3D\x44\x89\x6B\x6C\x44\x89\x73\x68",
            "xx?xxxxxx??xx??",
            0,
        )
        .unwrap();
        assert_eq!(selected[&Behavior::ClutchRevLimit].signature, expected);
        // untouched since the baseline
        assert_eq!(
            first_bytes(&selected[&Behavior::Abs], 2),
            vec![Byte::Exact(0x0B), Byte::Exact(0x45)]
        );
        // last changed in 1365
        assert_eq!(selected[&Behavior::Brake].signature.offset(), 12);
    }

    #[test]
    fn test_selection_above_last_tier() {
        let selected = select_for(3200);
        assert_eq!(
            first_bytes(&selected[&Behavior::ClutchRevLimit], 3),
            vec![Byte::Exact(0xC7), Byte::Exact(0x43), Byte::Any]
        );
        assert_eq!(selected[&Behavior::ClutchRevLimit].signature.len(), 21);
        assert_eq!(
            first_bytes(&selected[&Behavior::ShiftUp], 3),
            vec![Byte::Exact(0x66), Byte::Exact(0x01), Byte::Exact(0x2B)]
        );
        assert_eq!(selected[&Behavior::ThrottleLift].replacement, Replacement::nops(3));
    }

    #[test]
    fn test_baseline_selection() {
        let selected = select_for(877);
        assert_eq!(selected[&Behavior::SteeringAssist].signature.offset(), 0);
        assert_eq!(
            selected[&Behavior::SteeringAssist].replacement,
            Replacement::jmp_over_branch()
        );
        assert_eq!(selected[&Behavior::ShiftDown].signature.len(), 6);
        assert_eq!(select_for(1604)[&Behavior::SteeringAssist].signature.offset(), 3);
    }

    #[test]
    fn test_behavior_flags() {
        assert!(Behavior::ShiftUp.is_gearbox());
        assert!(!Behavior::Brake.is_gearbox());
        assert!(Behavior::SteeringAssist.enabled_by_default());
        assert!(!Behavior::ThrottleControl.enabled_by_default());
        assert_eq!(Behavior::ClutchRevLimit.to_string(), "Gears: Clutch Rev lim");
    }

    #[test]
    fn test_config_default() {
        assert_eq!(RegistryConfig::default().max_attempts, 4);
    }

    #[test]
    fn test_registry_gearbox_group() {
        let registry = PatchRegistry::new(RegistryConfig { max_attempts: 2 }).unwrap();
        let gearbox = registry.gearbox();
        assert_eq!(gearbox.name(), "Gears");
        assert_eq!(gearbox.members(), &Behavior::GEARBOX[..]);
        assert_eq!(gearbox.max_attempts(), 2);
        for behavior in Behavior::ALL.iter() {
            assert_eq!(gearbox.contains(behavior), behavior.is_gearbox());
        }
        assert_eq!(registry.version(), None);
    }
}
