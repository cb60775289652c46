//! Hardware descriptor parsing.
//!
//! A vendor XML register map is turned into an immutable [`Device`]. The
//! root element selects the dialect ([`Dialect::CmsisSvd`] for `<device>`,
//! [`Dialect::Atdf`] for `<avr-tools-device-file>`); each dialect module maps
//! its serde structs onto the shared model, after which the layout invariants
//! are checked once for all dialects.

pub mod atdf;
pub mod cache;
pub mod svd;

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DescriptorParseError;

/// Descriptor dialects the parser recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// ARM CMSIS-SVD (`<device>` root).
    CmsisSvd,
    /// Microchip ATDF (`<avr-tools-device-file>` root).
    Atdf,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::CmsisSvd => "cmsis-svd",
            Dialect::Atdf => "atdf",
        }
    }
}

/// Register and field access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    WriteOnce,
    ReadWriteOnce,
}

impl AccessMode {
    /// Parse the SVD spelling (`read-write`, `writeOnce`, ...).
    pub fn from_svd(raw: &str) -> Option<Self> {
        match raw.trim() {
            "read-only" => Some(AccessMode::ReadOnly),
            "write-only" => Some(AccessMode::WriteOnly),
            "read-write" => Some(AccessMode::ReadWrite),
            "writeOnce" => Some(AccessMode::WriteOnce),
            "read-writeOnce" => Some(AccessMode::ReadWriteOnce),
            _ => None,
        }
    }

    /// Parse the ATDF spelling (`R`, `W`, `RW`).
    pub fn from_atdf(raw: &str) -> Option<Self> {
        match raw.trim() {
            "R" => Some(AccessMode::ReadOnly),
            "W" => Some(AccessMode::WriteOnly),
            "RW" => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }
}

/// One bit field inside a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFieldDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub bit_offset: u32,
    pub bit_width: u32,
    pub access: Option<AccessMode>,
}

impl BitFieldDescriptor {
    /// Mask of the field in register position.
    pub fn mask(&self) -> u64 {
        self.unshifted_mask()
            .checked_shl(self.bit_offset)
            .unwrap_or(0)
    }

    /// Mask of the field aligned to bit 0.
    pub fn unshifted_mask(&self) -> u64 {
        if self.bit_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bit_width) - 1
        }
    }
}

/// One register of a peripheral, relative to its instance base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Byte offset from the instance base address.
    pub offset: u64,
    /// Width in bits.
    pub size: u32,
    pub access: AccessMode,
    pub reset_value: u64,
    pub fields: Vec<BitFieldDescriptor>,
}

impl RegisterDescriptor {
    pub fn byte_size(&self) -> u64 {
        u64::from(self.size).div_ceil(8)
    }
}

/// A concrete placement of a peripheral in the address map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInstance {
    pub name: String,
    pub base_address: u64,
}

/// A peripheral register layout and every instance that shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Base address of the first instance.
    pub base_address: u64,
    /// Size of the address block each instance occupies, in bytes.
    pub block_size: u64,
    pub instances: Vec<PeripheralInstance>,
    pub registers: Vec<RegisterDescriptor>,
}

impl PeripheralDescriptor {
    pub fn register(&self, name: &str) -> Option<&RegisterDescriptor> {
        self.registers.iter().find(|r| r.name == name)
    }
}

/// Root of a parsed hardware descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub dialect: Dialect,
    pub peripherals: Vec<PeripheralDescriptor>,
}

impl Device {
    /// Every `(descriptor, instance)` pair in declaration order.
    pub fn instances(&self) -> impl Iterator<Item = (&PeripheralDescriptor, &PeripheralInstance)> {
        self.peripherals
            .iter()
            .flat_map(|p| p.instances.iter().map(move |i| (p, i)))
    }

    /// Resolve an instance name (e.g. `GPIOA`) to its layout and placement.
    pub fn find_instance(
        &self,
        name: &str,
    ) -> Option<(&PeripheralDescriptor, &PeripheralInstance)> {
        self.instances().find(|(_, i)| i.name == name)
    }

    /// Lowest instance base and highest instance block end, if any.
    pub fn address_span(&self) -> Option<(u64, u64)> {
        let mut span: Option<(u64, u64)> = None;
        for (p, i) in self.instances() {
            let end = i.base_address.saturating_add(p.block_size);
            span = Some(match span {
                None => (i.base_address, end),
                Some((lo, hi)) => (lo.min(i.base_address), hi.max(end)),
            });
        }
        span
    }

    pub fn register_count(&self) -> usize {
        self.peripherals.iter().map(|p| p.registers.len()).sum()
    }
}

/// Read and parse the descriptor at `path`.
pub fn parse(path: &Path) -> Result<Device, DescriptorParseError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DescriptorParseError::new(path, None, format!("cannot read: {e}")))?;
    parse_str(&text, path)
}

/// Parse descriptor text; `origin` is only used for diagnostics.
pub fn parse_str(text: &str, origin: &Path) -> Result<Device, DescriptorParseError> {
    let device = match detect_dialect(text, origin)? {
        Dialect::CmsisSvd => svd::parse(text, origin)?,
        Dialect::Atdf => atdf::parse(text, origin)?,
    };
    check_layout(&device, text, origin)?;
    Ok(device)
}

/// Pick the dialect from the document's root element.
pub fn detect_dialect(text: &str, origin: &Path) -> Result<Dialect, DescriptorParseError> {
    let (root, offset) = root_element(text).ok_or_else(|| {
        DescriptorParseError::new(origin, None, "document has no root element")
    })?;
    match root.as_str() {
        "device" => Ok(Dialect::CmsisSvd),
        "avr-tools-device-file" => Ok(Dialect::Atdf),
        other => Err(DescriptorParseError::new(
            origin,
            Some(line_of(text, offset)),
            format!("unrecognised descriptor dialect: root element <{other}>"),
        )),
    }
}

/// Name and byte offset of the first element, skipping the prolog,
/// comments, processing instructions and doctype.
fn root_element(text: &str) -> Option<(String, usize)> {
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('<') {
        let start = pos + rel;
        let rest = &text[start..];
        if rest.starts_with("<!--") {
            pos = start + rest.find("-->")? + 3;
        } else if rest.starts_with("<?") {
            pos = start + rest.find("?>")? + 2;
        } else if rest.starts_with("<!") {
            pos = start + rest.find('>')? + 1;
        } else {
            let name: String = rest[1..]
                .chars()
                .take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
                .collect();
            if name.is_empty() {
                return None;
            }
            return Some((name, start));
        }
    }
    None
}

/// 1-indexed line number of a byte offset.
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}

/// Line of the first occurrence of `needle`, if present.
pub(crate) fn locate(text: &str, needle: &str) -> Option<usize> {
    text.find(needle).map(|offset| line_of(text, offset))
}

/// Parse `0x`-hex, `#`-binary or decimal integers.
pub(crate) fn parse_int(raw: &str) -> Result<u64, String> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = s.strip_prefix('#') {
        // SVD uses `x` for don't-care bits; treat them as zero.
        u64::from_str_radix(&bin.replace(['x', 'X'], "0"), 2)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| format!("invalid integer {s:?}"))
}

/// Widest register the model represents; masks and reset values are `u64`.
pub const MAX_REGISTER_BITS: u32 = 64;

/// Narrow a parsed bit count or position to `u32`.
pub(crate) fn to_bits(value: u64) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{value} does not fit in 32 bits"))
}

/// Turn a serde-xml-rs failure into a located parse error.
pub(crate) fn xml_error(origin: &Path, err: serde_xml_rs::Error) -> DescriptorParseError {
    let message = err.to_string();
    let line = Regex::new(r"(\d+):(\d+)")
        .ok()
        .and_then(|re| re.captures(&message))
        .and_then(|caps| caps[1].parse::<usize>().ok());
    DescriptorParseError::new(origin, line, format!("malformed XML: {message}"))
}

/// Layout invariants shared by every dialect.
fn check_layout(device: &Device, text: &str, origin: &Path) -> Result<(), DescriptorParseError> {
    let find = |name: &str| {
        let needle = match device.dialect {
            Dialect::CmsisSvd => format!("<name>{name}</name>"),
            Dialect::Atdf => format!("name=\"{name}\""),
        };
        locate(text, &needle).or_else(|| locate(text, name))
    };

    let mut instance_names = HashSet::new();
    for peripheral in &device.peripherals {
        for instance in &peripheral.instances {
            if !instance_names.insert(instance.name.as_str()) {
                return Err(DescriptorParseError::new(
                    origin,
                    find(&instance.name),
                    format!("duplicate peripheral instance {}", instance.name),
                ));
            }
        }

        let mut register_names = HashSet::new();
        for register in &peripheral.registers {
            if !register_names.insert(register.name.as_str()) {
                return Err(DescriptorParseError::new(
                    origin,
                    find(&register.name),
                    format!(
                        "duplicate register {} in peripheral {}",
                        register.name, peripheral.name
                    ),
                ));
            }

            if register.size == 0 || register.size > MAX_REGISTER_BITS {
                return Err(DescriptorParseError::new(
                    origin,
                    find(&register.name),
                    format!(
                        "register {}.{} is {} bits wide; supported widths are 1..={MAX_REGISTER_BITS}",
                        peripheral.name, register.name, register.size
                    ),
                ));
            }

            let end = register.offset.saturating_add(register.byte_size());
            if end > peripheral.block_size {
                return Err(DescriptorParseError::new(
                    origin,
                    find(&register.name),
                    format!(
                        "register {}.{} at offset {:#x} with size {} bits exceeds the {:#x}-byte address block",
                        peripheral.name,
                        register.name,
                        register.offset,
                        register.size,
                        peripheral.block_size
                    ),
                ));
            }

            for field in &register.fields {
                let fits = field
                    .bit_offset
                    .checked_add(field.bit_width)
                    .is_some_and(|end| end <= register.size);
                if field.bit_width == 0 || !fits {
                    return Err(DescriptorParseError::new(
                        origin,
                        find(&field.name),
                        format!(
                            "field {}.{}.{} (bits {}..{}) does not fit a {}-bit register",
                            peripheral.name,
                            register.name,
                            field.name,
                            field.bit_offset,
                            u64::from(field.bit_offset) + u64::from(field.bit_width),
                            register.size
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}
