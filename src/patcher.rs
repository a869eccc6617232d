use crate::memory::Memory;
use crate::pattern::Signature;
use crate::{PatchError, Result};
use log::{debug, error, trace};

const NOP: u8 = 0x90;

/// JumpTarget tells where a relative jump written by a patch lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpTarget {
    /// A fixed absolute address.
    Address(usize),
    /// The destination of the near branch currently at the patch address:
    /// `address + instruction_len + rel32`, with the rel32 read at
    /// `address + displacement_offset`.
    ExistingBranch {
        displacement_offset: usize,
        instruction_len: usize,
    },
}

/// Replacement describes the bytes a patch writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replacement {
    Literal(Vec<u8>),
    /// `opcode` followed by a 4-byte displacement to `target`, padded with NOPs
    /// up to `len` bytes.
    RelativeJump {
        opcode: Vec<u8>,
        target: JumpTarget,
        len: usize,
    },
}
impl Replacement {
    /// nops overwrites `len` bytes with NOPs.
    pub fn nops(len: usize) -> Self {
        Replacement::Literal(vec![NOP; len])
    }

    /// jmp reroutes a 6-byte near conditional branch into an unconditional
    /// `jmp rel32; nop` to the same destination.
    pub fn jmp_over_branch() -> Self {
        Replacement::RelativeJump {
            opcode: vec![0xE9],
            target: JumpTarget::ExistingBranch {
                displacement_offset: 2,
                instruction_len: 6,
            },
            len: 6,
        }
    }

    /// Number of bytes overwritten.
    pub fn len(&self) -> usize {
        match self {
            Replacement::Literal(bytes) => bytes.len(),
            Replacement::RelativeJump { opcode, len, .. } => (*len).max(opcode.len() + 4),
        }
    }

    /// encode computes the bytes to write at `address`, reading the current
    /// memory when the target depends on it.
    pub fn encode<M: Memory + ?Sized>(&self, memory: &M, address: usize) -> Result<Vec<u8>> {
        let (opcode, target) = match self {
            Replacement::Literal(bytes) => return Ok(bytes.clone()),
            Replacement::RelativeJump { opcode, target, .. } => (opcode, target),
        };
        let target = match *target {
            JumpTarget::Address(target) => target,
            JumpTarget::ExistingBranch {
                displacement_offset,
                instruction_len,
            } => {
                let at = address
                    .checked_add(displacement_offset)
                    .ok_or(PatchError::ReadPtrError(address, displacement_offset + 4))?;
                let raw = memory.read(at, 4)?;
                let displacement = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                address
                    .checked_add(instruction_len)
                    .ok_or(PatchError::ReadPtrError(address, instruction_len))?
                    .wrapping_add(displacement as isize as usize)
            }
        };
        let next = address
            .checked_add(opcode.len() + 4)
            .ok_or(PatchError::WritePtrError(address, self.len()))?;
        let displacement = (target as isize).wrapping_sub(next as isize);
        if displacement < i32::MIN as isize || displacement > i32::MAX as isize {
            return Err(PatchError::JumpOutOfRange(address, target));
        }
        trace!("Jump from {:#x} to {:#x} ({:+#x})", address, target, displacement);

        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(opcode);
        bytes.extend_from_slice(&(displacement as i32).to_le_bytes());
        bytes.resize(self.len(), NOP);
        Ok(bytes)
    }
}

/// PatchDef is the version-specific part of a patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchDef {
    pub signature: Signature,
    pub replacement: Replacement,
}
impl PatchDef {
    pub fn new(signature: Signature, replacement: Replacement) -> Self {
        PatchDef {
            signature,
            replacement,
        }
    }
}

#[derive(Clone, Debug)]
struct Applied {
    address: usize,
    original: Vec<u8>,
}

/// Patch is one reversible modification of the host code.
///
/// A patch starts without a definition; `configure` selects the signature and
/// replacement for the running build. `patch` and `restore` return true exactly
/// once per transition, repeated calls are no-ops returning false.
#[derive(Debug)]
pub struct Patch {
    name: String,
    def: Option<PatchDef>,
    found: Option<usize>,
    applied: Option<Applied>,
    enabled_by_default: bool,
}
impl Patch {
    pub fn new(name: &str, enabled_by_default: bool) -> Self {
        Patch {
            name: name.to_string(),
            def: None,
            found: None,
            applied: None,
            enabled_by_default,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> Option<&PatchDef> {
        self.def.as_ref()
    }

    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    pub fn enabled_by_default(&self) -> bool {
        self.enabled_by_default
    }

    /// Address of the last match, if the current definition was found.
    pub fn found_address(&self) -> Option<usize> {
        self.found
    }

    /// Bytes saved by the last application, if applied.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        self.applied.as_ref().map(|applied| applied.original.as_slice())
    }

    /// configure replaces the definition and forgets the previous match.
    /// The applied state is kept: a later restore writes back where the
    /// bytes were actually changed.
    pub fn configure(&mut self, def: PatchDef) {
        self.def = Some(def);
        self.found = None;
    }

    fn signature(&self) -> Result<&Signature> {
        self.def
            .as_ref()
            .map(|def| &def.signature)
            .ok_or_else(|| PatchError::NotConfigured(self.name.clone()))
    }

    /// test scans for the signature without writing.
    pub fn test<M: Memory + ?Sized>(&self, memory: &M) -> bool {
        match self.signature().and_then(|signature| signature.find(memory)) {
            Ok(address) => {
                debug!("[Patch] [{}] Found at {:#x}", self.name, address);
                true
            }
            Err(e) => {
                error!("[Patch] [{}] Test failed: {}", self.name, e);
                false
            }
        }
    }

    /// patch applies the replacement, see `try_patch`.
    pub fn patch<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        match self.try_patch(memory) {
            Ok(patched) => patched,
            Err(e) => {
                error!("[Patch] [{}] Patching failed: {}", self.name, e);
                false
            }
        }
    }

    /// try_patch returns Ok(false) when already applied, Ok(true) when the bytes
    /// were swapped by this call.
    pub fn try_patch<M: Memory + ?Sized>(&mut self, memory: &mut M) -> Result<bool> {
        if self.applied.is_some() {
            trace!("[Patch] [{}] Already applied", self.name);
            return Ok(false);
        }
        let found = match self.found {
            Some(found) => found,
            None => {
                let found = self.signature()?.find(&*memory)?;
                self.found = Some(found);
                found
            }
        };
        let def = self
            .def
            .as_ref()
            .ok_or_else(|| PatchError::NotConfigured(self.name.clone()))?;
        let address = found
            .checked_add(def.signature.offset())
            .ok_or(PatchError::WritePtrError(found, def.replacement.len()))?;
        let bytes = def.replacement.encode(&*memory, address)?;
        let original = memory.read(address, bytes.len())?;
        memory.write(address, &bytes)?;
        debug!("[Patch] [{}] Patched {:#x}", self.name, address);
        self.applied = Some(Applied { address, original });
        Ok(true)
    }

    /// restore writes back the saved bytes, see `try_restore`.
    pub fn restore<M: Memory + ?Sized>(&mut self, memory: &mut M) -> bool {
        match self.try_restore(memory) {
            Ok(restored) => restored,
            Err(e) => {
                error!("[Patch] [{}] Restoring failed: {}", self.name, e);
                false
            }
        }
    }

    /// try_restore returns Ok(false) when not applied, Ok(true) when the saved
    /// bytes were written back by this call.
    pub fn try_restore<M: Memory + ?Sized>(&mut self, memory: &mut M) -> Result<bool> {
        let applied = match &self.applied {
            Some(applied) => applied,
            None => {
                trace!("[Patch] [{}] Not applied", self.name);
                return Ok(false);
            }
        };
        memory.write(applied.address, &applied.original)?;
        debug!("[Patch] [{}] Restored {:#x}", self.name, applied.address);
        self.applied = None;
        Ok(true)
    }
}
