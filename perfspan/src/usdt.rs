//! # USDT Probe Discovery
//!
//! Reads the SystemTap SDT notes of the instrumented binary and turns every
//! `perfspan:enter` / `perfspan:exit` call site into an attach offset plus the
//! [`UsdtSpec`] the BPF handler uses to fetch the probe arguments.
//!
//! ## Note Layout
//!
//! ```text
//! .note.stapsdt, one note per call site (owner "stapsdt", type 3):
//!   desc: pc, base, semaphore     (address-sized)
//!         provider\0 name\0 args\0
//! ```
//!
//! `pc` is a link-time address. If the binary was prelinked it is shifted by the
//! difference between the `.stapsdt.base` section address and `base`, then
//! translated to a file offset through the loadable segments, which is what
//! uprobes attach to.

use std::path::Path;

use object::{Architecture, Object, ObjectSection, ObjectSegment};
use perfspan_common::{usdt::USDT_MAX_ARGS, UsdtArg, UsdtSpec, USDT_LAYOUT_SLOTS};

use crate::domain::LoaderError;

const NT_STAPSDT: u32 = 3;
const STAPSDT_OWNER: &[u8] = b"stapsdt";

/// One call site of a USDT probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdtProbe {
    pub provider: String,
    pub name: String,
    /// Link-time address, already adjusted for `.stapsdt.base`
    pub address: u64,
    /// File offset the uprobe attaches to
    pub file_offset: u64,
    /// Address of the semaphore, 0 if the probe is not guarded
    pub semaphore: u64,
    /// Raw SDT argument string, e.g. `8@%rdi 8@%rsi 8@%rdx`
    pub args: String,
}

/// Call sites of one probe that share an argument string
#[derive(Debug, Clone)]
pub struct ProbeLayout {
    pub args: String,
    pub spec: UsdtSpec,
    pub sites: Vec<UsdtProbe>,
}

/// All call sites of one probe, grouped by argument layout
///
/// `layouts[i]` is attached through layout slot `i`, in order of first appearance.
#[derive(Debug, Clone)]
pub struct ResolvedProbe {
    pub provider: String,
    pub name: String,
    pub layouts: Vec<ProbeLayout>,
}

impl ResolvedProbe {
    /// Whether any call site sits behind a semaphore
    #[must_use]
    pub fn has_semaphore(&self) -> bool {
        self.sites().any(|site| site.semaphore != 0)
    }

    /// Every call site, across layouts
    pub fn sites(&self) -> impl Iterator<Item = &UsdtProbe> {
        self.layouts.iter().flat_map(|layout| &layout.sites)
    }

    #[must_use]
    pub fn site_count(&self) -> usize {
        self.layouts.iter().map(|layout| layout.sites.len()).sum()
    }
}

/// Register file layout used to interpret argument strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterLayout {
    X86_64,
    Aarch64,
}

impl RegisterLayout {
    fn for_architecture(arch: Architecture) -> Option<Self> {
        match arch {
            Architecture::X86_64 => Some(Self::X86_64),
            Architecture::Aarch64 => Some(Self::Aarch64),
            _ => None,
        }
    }
}

/// A note before address adjustment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNote {
    pub pc: u64,
    pub base: u64,
    pub semaphore: u64,
    pub provider: String,
    pub name: String,
    pub args: String,
}

/// A loadable segment, for address → file offset translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
}

/// Translate a virtual address to a file offset
#[must_use]
pub fn to_file_offset(segments: &[Segment], address: u64) -> Option<u64> {
    segments
        .iter()
        .find(|s| address >= s.address && address - s.address < s.size)
        .map(|s| address - s.address + s.file_offset)
}

// ============================================================================
// ELF Reading
// ============================================================================

/// Read every USDT call site of `binary`
///
/// A binary without `.note.stapsdt` yields an empty list.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, or a note is malformed.
pub fn read_probes(binary: &Path) -> Result<(RegisterLayout, Vec<UsdtProbe>), LoaderError> {
    let data = std::fs::read(binary)?;
    let obj = object::File::parse(&*data)?;

    let malformed = |reason: String| LoaderError::MalformedNote { binary: binary.to_path_buf(), reason };

    let layout = RegisterLayout::for_architecture(obj.architecture())
        .ok_or_else(|| malformed(format!("unsupported architecture {:?}", obj.architecture())))?;

    let Some(section) = obj.section_by_name(".note.stapsdt") else {
        return Ok((layout, Vec::new()));
    };
    let notes = parse_notes(section.data()?, obj.is_little_endian(), obj.is_64()).map_err(malformed)?;

    let sdt_base = obj.section_by_name(".stapsdt.base").map(|s| s.address());
    let segments: Vec<Segment> = obj
        .segments()
        .map(|s| Segment { address: s.address(), size: s.size(), file_offset: s.file_range().0 })
        .collect();

    let mut probes = Vec::with_capacity(notes.len());
    for note in notes {
        let address = match sdt_base {
            Some(actual) if note.base != 0 => note.pc.wrapping_add(actual.wrapping_sub(note.base)),
            _ => note.pc,
        };
        let file_offset = to_file_offset(&segments, address).ok_or_else(|| {
            malformed(format!(
                "{}:{} at 0x{address:x} is outside every loadable segment",
                note.provider, note.name
            ))
        })?;
        probes.push(UsdtProbe {
            provider: note.provider,
            name: note.name,
            address,
            file_offset,
            semaphore: note.semaphore,
            args: note.args,
        });
    }
    Ok((layout, probes))
}

/// Parse the raw contents of a `.note.stapsdt` section
///
/// # Errors
/// Returns a description of the first malformed note.
pub fn parse_notes(data: &[u8], little_endian: bool, is_64: bool) -> Result<Vec<RawNote>, String> {
    let read_u32 = |b: &[u8]| {
        let raw = [b[0], b[1], b[2], b[3]];
        if little_endian { u32::from_le_bytes(raw) } else { u32::from_be_bytes(raw) }
    };
    let addr_size = if is_64 { 8 } else { 4 };
    let read_addr = |b: &[u8]| {
        if is_64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[..8]);
            if little_endian { u64::from_le_bytes(raw) } else { u64::from_be_bytes(raw) }
        } else {
            u64::from(read_u32(b))
        }
    };

    let mut notes = Vec::new();
    let mut pos = 0usize;
    while pos + 12 <= data.len() {
        let namesz = read_u32(&data[pos..]) as usize;
        let descsz = read_u32(&data[pos + 4..]) as usize;
        let note_type = read_u32(&data[pos + 8..]);
        pos += 12;

        let name_end = pos + namesz;
        let desc_start = pos + align4(namesz);
        let desc_end = desc_start + descsz;
        if desc_end > data.len() {
            return Err(format!("note at offset {pos} runs past the section end"));
        }
        let owner = data[pos..name_end].strip_suffix(&[0u8]).unwrap_or(&data[pos..name_end]);
        let desc = &data[desc_start..desc_end];
        pos = desc_start + align4(descsz);

        if note_type != NT_STAPSDT || owner != STAPSDT_OWNER {
            continue;
        }
        if desc.len() < 3 * addr_size {
            return Err(format!("stapsdt note descriptor of {} bytes is too short", desc.len()));
        }

        let mut strings = desc[3 * addr_size..].split(|&b| b == 0);
        let mut next_string = |what: &str| -> Result<String, String> {
            strings
                .next()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .ok_or_else(|| format!("stapsdt note is missing its {what}"))
        };
        let provider = next_string("provider")?;
        let name = next_string("name")?;
        let args = next_string("argument string")?;

        notes.push(RawNote {
            pc: read_addr(desc),
            base: read_addr(&desc[addr_size..]),
            semaphore: read_addr(&desc[2 * addr_size..]),
            provider,
            name,
            args,
        });
    }
    Ok(notes)
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// ============================================================================
// Probe Resolution
// ============================================================================

/// Collect the call sites of `provider:name` and group them by argument layout
///
/// # Errors
/// - [`LoaderError::ProbeNotFound`] if no call site exists
/// - [`LoaderError::InconsistentProbeArgs`] if the sites use more than
///   [`USDT_LAYOUT_SLOTS`] distinct argument layouts
/// - [`LoaderError::ProbeArity`] if a layout does not take `expected_args` arguments
pub fn resolve_probe(
    binary: &Path,
    layout: RegisterLayout,
    probes: &[UsdtProbe],
    provider: &str,
    name: &str,
    expected_args: usize,
) -> Result<ResolvedProbe, LoaderError> {
    let mut layouts: Vec<ProbeLayout> = Vec::new();
    for site in probes.iter().filter(|p| p.provider == provider && p.name == name) {
        if let Some(group) = layouts.iter_mut().find(|group| group.args == site.args) {
            group.sites.push(site.clone());
            continue;
        }
        if layouts.len() == USDT_LAYOUT_SLOTS as usize {
            return Err(LoaderError::InconsistentProbeArgs {
                provider: provider.to_string(),
                name: name.to_string(),
                max: layouts.len(),
                other: site.args.clone(),
            });
        }
        let spec = layout_spec(layout, provider, name, &site.args, expected_args)?;
        layouts.push(ProbeLayout { args: site.args.clone(), spec, sites: vec![site.clone()] });
    }

    if layouts.is_empty() {
        return Err(LoaderError::ProbeNotFound {
            provider: provider.to_string(),
            name: name.to_string(),
            binary: binary.to_path_buf(),
        });
    }
    Ok(ResolvedProbe { provider: provider.to_string(), name: name.to_string(), layouts })
}

#[allow(clippy::cast_possible_truncation)]
fn layout_spec(
    layout: RegisterLayout,
    provider: &str,
    name: &str,
    args: &str,
    expected_args: usize,
) -> Result<UsdtSpec, LoaderError> {
    let parsed = parse_arg_string(layout, args)?;
    if parsed.len() != expected_args {
        return Err(LoaderError::ProbeArity {
            provider: provider.to_string(),
            name: name.to_string(),
            expected: expected_args,
            actual: parsed.len(),
        });
    }

    let mut spec = UsdtSpec::default();
    for (slot, arg) in spec.args.iter_mut().zip(&parsed) {
        *slot = *arg;
    }
    spec.arg_count = parsed.len() as u32;
    Ok(spec)
}

// ============================================================================
// Argument Strings
// ============================================================================

/// Parse a whole SDT argument string into argument locations
///
/// # Errors
/// Returns [`LoaderError::UnsupportedProbeArg`] for any operand the BPF side cannot evaluate.
pub fn parse_arg_string(layout: RegisterLayout, args: &str) -> Result<Vec<UsdtArg>, LoaderError> {
    let parsed = split_args(args)
        .into_iter()
        .map(|arg| parse_arg(layout, &arg))
        .collect::<Result<Vec<_>, _>>()?;
    if parsed.len() > USDT_MAX_ARGS {
        return Err(unsupported(args, &format!("more than {USDT_MAX_ARGS} arguments")));
    }
    Ok(parsed)
}

/// Split on spaces, keeping aarch64 `[reg, off]` operands together
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in args.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Parse one `[-]SIZE@OPERAND` argument
///
/// # Errors
/// Returns [`LoaderError::UnsupportedProbeArg`] if the operand cannot be evaluated.
pub fn parse_arg(layout: RegisterLayout, arg: &str) -> Result<UsdtArg, LoaderError> {
    let (size_part, operand) =
        arg.split_once('@').ok_or_else(|| unsupported(arg, "missing '@' after the size"))?;
    let signed = size_part.starts_with('-');
    let size: u8 = size_part
        .trim_start_matches('-')
        .parse()
        .ok()
        .filter(|s| matches!(s, 1 | 2 | 4 | 8))
        .ok_or_else(|| unsupported(arg, "operand size must be 1, 2, 4 or 8"))?;

    match layout {
        RegisterLayout::X86_64 => parse_x86_operand(arg, operand, size, signed),
        RegisterLayout::Aarch64 => parse_aarch64_operand(arg, operand, size, signed),
    }
}

fn parse_x86_operand(arg: &str, operand: &str, size: u8, signed: bool) -> Result<UsdtArg, LoaderError> {
    if let Some(imm) = operand.strip_prefix('$') {
        let value = parse_number(imm).ok_or_else(|| unsupported(arg, "immediate is not a number"))?;
        return Ok(UsdtArg::constant(value, size, signed));
    }
    if let Some(reg) = operand.strip_prefix('%') {
        let offset = x86_register(reg).ok_or_else(|| unsupported(arg, "unknown register"))?;
        return Ok(UsdtArg::register(offset, size, signed));
    }
    if let Some((disp, rest)) = operand.split_once('(') {
        let inner = rest.strip_suffix(')').ok_or_else(|| unsupported(arg, "unterminated memory operand"))?;
        if inner.contains(',') {
            return Err(unsupported(arg, "indexed addressing"));
        }
        let reg = inner.strip_prefix('%').ok_or_else(|| unsupported(arg, "expected a base register"))?;
        if reg == "rip" {
            return Err(unsupported(arg, "rip-relative addressing"));
        }
        let offset = x86_register(reg).ok_or_else(|| unsupported(arg, "unknown register"))?;
        let displacement = if disp.is_empty() {
            0
        } else {
            parse_number(disp).ok_or_else(|| unsupported(arg, "displacement is not a number"))?
        };
        return Ok(UsdtArg::deref(offset, displacement, size, signed));
    }
    Err(unsupported(arg, "unrecognized operand"))
}

fn parse_aarch64_operand(arg: &str, operand: &str, size: u8, signed: bool) -> Result<UsdtArg, LoaderError> {
    if let Some(inner) = operand.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(|| unsupported(arg, "unterminated memory operand"))?;
        let (reg, disp) = match inner.split_once(',') {
            Some((reg, disp)) => (reg.trim(), Some(disp.trim().trim_start_matches('#'))),
            None => (inner.trim(), None),
        };
        let offset = aarch64_register(reg).ok_or_else(|| unsupported(arg, "unknown register"))?;
        let displacement = match disp {
            Some(d) => parse_number(d).ok_or_else(|| unsupported(arg, "offset is not a number"))?,
            None => 0,
        };
        return Ok(UsdtArg::deref(offset, displacement, size, signed));
    }
    if let Some(offset) = aarch64_register(operand) {
        return Ok(UsdtArg::register(offset, size, signed));
    }
    if let Some(value) = parse_number(operand.trim_start_matches('#')) {
        return Ok(UsdtArg::constant(value, size, signed));
    }
    Err(unsupported(arg, "unrecognized operand"))
}

/// Offset of an x86_64 register (any width alias) inside `struct pt_regs`
fn x86_register(name: &str) -> Option<u32> {
    const REGS: &[(&[&str], u32)] = &[
        (&["r15", "r15d", "r15w", "r15b"], 0),
        (&["r14", "r14d", "r14w", "r14b"], 8),
        (&["r13", "r13d", "r13w", "r13b"], 16),
        (&["r12", "r12d", "r12w", "r12b"], 24),
        (&["rbp", "ebp", "bp", "bpl"], 32),
        (&["rbx", "ebx", "bx", "bl"], 40),
        (&["r11", "r11d", "r11w", "r11b"], 48),
        (&["r10", "r10d", "r10w", "r10b"], 56),
        (&["r9", "r9d", "r9w", "r9b"], 64),
        (&["r8", "r8d", "r8w", "r8b"], 72),
        (&["rax", "eax", "ax", "al"], 80),
        (&["rcx", "ecx", "cx", "cl"], 88),
        (&["rdx", "edx", "dx", "dl"], 96),
        (&["rsi", "esi", "si", "sil"], 104),
        (&["rdi", "edi", "di", "dil"], 112),
        (&["rip"], 128),
        (&["rsp", "esp", "sp", "spl"], 152),
    ];
    REGS.iter().find(|(names, _)| names.contains(&name)).map(|&(_, offset)| offset)
}

/// Offset of an aarch64 register inside `struct user_pt_regs`
fn aarch64_register(name: &str) -> Option<u32> {
    if name == "sp" {
        return Some(248);
    }
    let index: u32 = name.strip_prefix('x').or_else(|| name.strip_prefix('w'))?.parse().ok()?;
    (index <= 30).then_some(index * 8)
}

fn parse_number(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn unsupported(arg: &str, reason: &str) -> LoaderError {
    LoaderError::UnsupportedProbeArg { arg: arg.to_string(), reason: reason.to_string() }
}
