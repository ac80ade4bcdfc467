//! USDT argument locations
//!
//! The loader parses each probe's SDT argument string (`8@%rdi`, `-4@$5`,
//! `8@-16(%rbp)`, ...) into a [`UsdtSpec`] and stores it in the `USDT_SPECS`
//! map. The probe handler evaluates it against the trapped task's registers.

use crate::USDT_LAYOUT_SLOTS;

/// Argument is an immediate constant
pub const ARG_CONST: u32 = 0;
/// Argument lives in a register
pub const ARG_REG: u32 = 1;
/// Argument lives in user memory at register + displacement
pub const ARG_REG_DEREF: u32 = 2;

/// Most arguments any perfspan probe takes (`enter`: span id, name length, name pointer)
pub const USDT_MAX_ARGS: usize = 3;

/// Error code for a spec the handler cannot evaluate (`-EINVAL`)
pub const EINVAL: i64 = -22;

/// `USDT_SPECS` entry of layout `slot` of probe kind `probe`
#[inline(always)]
#[must_use]
pub const fn usdt_spec_index(probe: u32, slot: u32) -> u32 {
    probe * USDT_LAYOUT_SLOTS + slot
}

/// Location of one probe argument
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsdtArg {
    /// One of [`ARG_CONST`], [`ARG_REG`], [`ARG_REG_DEREF`]
    pub kind: u32,

    /// Byte offset of the register inside `pt_regs`
    pub reg_offset: u32,

    /// Constant value, or displacement added to the register for derefs
    pub value: i64,

    /// Operand size in bytes (1, 2, 4 or 8)
    pub size: u8,

    /// Whether the operand is sign-extended
    pub signed: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 6],
}

impl UsdtArg {
    #[must_use]
    pub const fn constant(value: i64, size: u8, signed: bool) -> Self {
        Self { kind: ARG_CONST, reg_offset: 0, value, size, signed: signed as u8, _padding: [0; 6] }
    }

    #[must_use]
    pub const fn register(reg_offset: u32, size: u8, signed: bool) -> Self {
        Self { kind: ARG_REG, reg_offset, value: 0, size, signed: signed as u8, _padding: [0; 6] }
    }

    #[must_use]
    pub const fn deref(reg_offset: u32, displacement: i64, size: u8, signed: bool) -> Self {
        Self {
            kind: ARG_REG_DEREF,
            reg_offset,
            value: displacement,
            size,
            signed: signed as u8,
            _padding: [0; 6],
        }
    }

    /// Narrow a raw 64-bit fetch to the operand width, sign- or zero-extending
    #[inline(always)]
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn normalize(&self, raw: u64) -> u64 {
        if self.size == 0 || self.size >= 8 {
            return raw;
        }
        let shift = 64 - u32::from(self.size) * 8;
        if self.signed != 0 {
            (((raw << shift) as i64) >> shift) as u64
        } else {
            (raw << shift) >> shift
        }
    }

    /// Evaluate the argument against the trapped task
    ///
    /// # Errors
    /// Propagates register/memory read failures; unknown kinds yield [`EINVAL`].
    #[inline(always)]
    #[allow(clippy::cast_sign_loss)]
    pub fn fetch<R: UsdtRegisters + ?Sized>(&self, regs: &R) -> Result<u64, i64> {
        let raw = match self.kind {
            ARG_CONST => self.value as u64,
            ARG_REG => regs.read_register(self.reg_offset)?,
            ARG_REG_DEREF => {
                let base = regs.read_register(self.reg_offset)?;
                // Only the operand's own bytes: a narrow operand may end a mapping
                let mut buf = [0u8; 8];
                let len = match self.size {
                    1 => 1,
                    2 => 2,
                    4 => 4,
                    _ => 8,
                };
                regs.read_user(base.wrapping_add(self.value as u64), &mut buf[..len])?;
                u64::from_le_bytes(buf)
            }
            _ => return Err(EINVAL),
        };
        Ok(self.normalize(raw))
    }
}

/// Argument locations of one probe
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsdtSpec {
    pub args: [UsdtArg; USDT_MAX_ARGS],
    pub arg_count: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
}

impl UsdtSpec {
    /// Evaluate argument `index`
    ///
    /// # Errors
    /// Returns [`EINVAL`] if the probe has no such argument, or the fetch error.
    #[inline(always)]
    pub fn arg<R: UsdtRegisters + ?Sized>(&self, regs: &R, index: usize) -> Result<u64, i64> {
        if index >= self.arg_count as usize || index >= USDT_MAX_ARGS {
            return Err(EINVAL);
        }
        self.args[index].fetch(regs)
    }
}

/// Register and user-memory access of the trapped task
pub trait UsdtRegisters {
    /// Read the 64-bit register at `offset` bytes into `pt_regs`
    ///
    /// # Errors
    /// Returns the helper's error code.
    fn read_register(&self, offset: u32) -> Result<u64, i64>;

    /// Fill `dst` from user memory at `addr`
    ///
    /// # Errors
    /// Returns the helper's error code.
    fn read_user(&self, addr: u64, dst: &mut [u8]) -> Result<(), i64>;
}
