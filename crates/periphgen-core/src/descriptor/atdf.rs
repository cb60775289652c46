//! Microchip ATDF dialect.
//!
//! Device instances live under `devices/device/peripherals/module/instance`
//! and point at a register group declared under `modules/module`. Every
//! instance that points at the same group shares one
//! [`PeripheralDescriptor`].

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::{
    locate, parse_int, to_bits, xml_error, AccessMode, BitFieldDescriptor, Device, Dialect,
    PeripheralDescriptor, PeripheralInstance, RegisterDescriptor,
};
use crate::error::DescriptorParseError;

#[derive(Debug, Deserialize)]
struct AtdfFile {
    devices: AtdfDevices,
    modules: AtdfModules,
}

#[derive(Debug, Deserialize)]
struct AtdfDevices {
    #[serde(rename = "device", default)]
    device: Vec<AtdfDevice>,
}

#[derive(Debug, Deserialize)]
struct AtdfDevice {
    name: String,
    peripherals: Option<AtdfDevicePeripherals>,
}

#[derive(Debug, Deserialize)]
struct AtdfDevicePeripherals {
    #[serde(rename = "module", default)]
    module: Vec<AtdfDeviceModule>,
}

#[derive(Debug, Deserialize)]
struct AtdfDeviceModule {
    name: String,
    #[serde(rename = "instance", default)]
    instance: Vec<AtdfInstance>,
}

#[derive(Debug, Deserialize)]
struct AtdfInstance {
    name: String,
    #[serde(rename = "register-group", default)]
    register_group: Vec<AtdfInstanceGroup>,
}

#[derive(Debug, Deserialize)]
struct AtdfInstanceGroup {
    name: String,
    #[serde(rename = "name-in-module")]
    name_in_module: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtdfModules {
    #[serde(rename = "module", default)]
    module: Vec<AtdfModule>,
}

#[derive(Debug, Deserialize)]
struct AtdfModule {
    name: String,
    #[serde(rename = "register-group", default)]
    register_group: Vec<AtdfGroup>,
}

#[derive(Debug, Deserialize)]
struct AtdfGroup {
    name: String,
    caption: Option<String>,
    size: Option<String>,
    #[serde(rename = "register", default)]
    register: Vec<AtdfRegister>,
}

#[derive(Debug, Deserialize)]
struct AtdfRegister {
    name: String,
    caption: Option<String>,
    offset: String,
    /// Width in bytes.
    size: Option<String>,
    rw: Option<String>,
    initval: Option<String>,
    #[serde(rename = "bitfield", default)]
    bitfield: Vec<AtdfBitfield>,
}

#[derive(Debug, Deserialize)]
struct AtdfBitfield {
    name: String,
    caption: Option<String>,
    mask: String,
    rw: Option<String>,
}

struct Ctx<'a> {
    text: &'a str,
    origin: &'a Path,
}

impl Ctx<'_> {
    fn error(&self, element: &str, message: String) -> DescriptorParseError {
        DescriptorParseError::new(
            self.origin,
            locate(self.text, &format!("name=\"{element}\"")),
            message,
        )
    }

    fn int(&self, element: &str, what: &str, raw: &str) -> Result<u64, DescriptorParseError> {
        parse_int(raw).map_err(|e| self.error(element, format!("{element}: {what}: {e}")))
    }

    fn access(&self, element: &str, raw: &str) -> Result<AccessMode, DescriptorParseError> {
        AccessMode::from_atdf(raw)
            .ok_or_else(|| self.error(element, format!("{element}: unknown rw {raw:?}")))
    }
}

/// Parse ATDF text into a [`Device`]. Only the first `<device>` is used.
pub fn parse(text: &str, origin: &Path) -> Result<Device, DescriptorParseError> {
    let raw: AtdfFile = serde_xml_rs::from_str(text).map_err(|e| xml_error(origin, e))?;
    let ctx = Ctx { text, origin };

    let device = raw
        .devices
        .device
        .first()
        .ok_or_else(|| DescriptorParseError::new(origin, None, "no <device> element"))?;

    let mut peripherals: Vec<PeripheralDescriptor> = Vec::new();
    // (module, group) -> index into `peripherals`
    let mut layouts: HashMap<(String, String), usize> = HashMap::new();

    let device_modules = device
        .peripherals
        .as_ref()
        .map(|p| p.module.as_slice())
        .unwrap_or_default();

    for device_module in device_modules {
        let module = raw
            .modules
            .module
            .iter()
            .find(|m| m.name == device_module.name)
            .ok_or_else(|| {
                ctx.error(
                    &device_module.name,
                    format!("module {} has no register definition", device_module.name),
                )
            })?;

        for instance in &device_module.instance {
            for placement in &instance.register_group {
                let group_name = placement
                    .name_in_module
                    .clone()
                    .unwrap_or_else(|| placement.name.clone());
                let group = module
                    .register_group
                    .iter()
                    .find(|g| g.name == group_name)
                    .ok_or_else(|| {
                        ctx.error(
                            &placement.name,
                            format!(
                                "instance {} refers to unknown register group {}.{}",
                                instance.name, module.name, group_name
                            ),
                        )
                    })?;

                let offset = match &placement.offset {
                    Some(o) => ctx.int(&placement.name, "offset", o)?,
                    None => 0,
                };

                let key = (module.name.clone(), group_name.clone());
                match layouts.get(&key).copied() {
                    Some(idx) => {
                        let shift = if group.size.is_none() {
                            rebase_shift(&peripherals[idx], offset)
                        } else {
                            0
                        };
                        peripherals[idx].instances.push(PeripheralInstance {
                            name: instance_name(instance, placement),
                            base_address: offset + shift,
                        });
                    }
                    None => {
                        let mut descriptor = convert_group(&ctx, group)?;
                        let name = instance_name(instance, placement);
                        // AVR groups without a declared size carry absolute
                        // register offsets with a zero placement; move the
                        // base to the first register.
                        let base = if offset == 0 && group.size.is_none() {
                            let lowest = descriptor.registers.iter().map(|r| r.offset).min();
                            match lowest {
                                Some(lowest) => {
                                    for r in &mut descriptor.registers {
                                        r.offset -= lowest;
                                    }
                                    descriptor.block_size = register_span(&descriptor.registers);
                                    lowest
                                }
                                None => 0,
                            }
                        } else {
                            offset
                        };
                        descriptor.base_address = base;
                        descriptor.instances = vec![PeripheralInstance {
                            name,
                            base_address: base,
                        }];
                        layouts.insert(key, peripherals.len());
                        peripherals.push(descriptor);
                    }
                }
            }
        }
    }

    Ok(Device {
        name: device.name.clone(),
        dialect: Dialect::Atdf,
        peripherals,
    })
}

/// Offset added to a later placement of an already rebased layout.
fn rebase_shift(layout: &PeripheralDescriptor, offset: u64) -> u64 {
    if offset == 0 {
        layout.base_address
    } else {
        0
    }
}

/// A single-group instance is named after the instance; multi-group
/// instances use the placement name.
fn instance_name(instance: &AtdfInstance, placement: &AtdfInstanceGroup) -> String {
    if instance.register_group.len() == 1 {
        instance.name.clone()
    } else {
        placement.name.clone()
    }
}

fn convert_group(
    ctx: &Ctx<'_>,
    group: &AtdfGroup,
) -> Result<PeripheralDescriptor, DescriptorParseError> {
    let mut registers = Vec::new();
    for r in &group.register {
        registers.push(convert_register(ctx, r)?);
    }

    // A declared size is authoritative; registers past it are rejected by
    // the shared layout check.
    let block_size = match &group.size {
        Some(s) => ctx.int(&group.name, "size", s)?,
        None => register_span(&registers),
    };

    Ok(PeripheralDescriptor {
        name: group.name.clone(),
        description: group.caption.clone(),
        base_address: 0,
        block_size,
        instances: Vec::new(),
        registers,
    })
}

/// End of the furthest register, in bytes from offset 0.
fn register_span(registers: &[RegisterDescriptor]) -> u64 {
    registers
        .iter()
        .map(|r| r.offset.saturating_add(r.byte_size()))
        .max()
        .unwrap_or(0)
}

fn convert_register(
    ctx: &Ctx<'_>,
    r: &AtdfRegister,
) -> Result<RegisterDescriptor, DescriptorParseError> {
    let offset = ctx.int(&r.name, "offset", &r.offset)?;
    let bytes = match &r.size {
        Some(s) => ctx.int(&r.name, "size", s)?,
        None => 1,
    };
    let size = bytes
        .checked_mul(8)
        .and_then(|bits| to_bits(bits).ok())
        .ok_or_else(|| ctx.error(&r.name, format!("{}: size {bytes} bytes is too large", r.name)))?;
    let access = match &r.rw {
        Some(rw) => ctx.access(&r.name, rw)?,
        None => AccessMode::ReadWrite,
    };
    let reset_value = match &r.initval {
        Some(v) => ctx.int(&r.name, "initval", v)?,
        None => 0,
    };

    let mut fields = Vec::new();
    for b in &r.bitfield {
        let mask = ctx.int(&b.name, "mask", &b.mask)?;
        let (bit_offset, bit_width) = mask_span(mask).ok_or_else(|| {
            ctx.error(
                &b.name,
                format!("{}: mask {mask:#x} is not a contiguous bit run", b.name),
            )
        })?;
        let access = match &b.rw {
            Some(rw) => Some(ctx.access(&b.name, rw)?),
            None => None,
        };
        fields.push(BitFieldDescriptor {
            name: b.name.clone(),
            description: b.caption.clone(),
            bit_offset,
            bit_width,
            access,
        });
    }

    Ok(RegisterDescriptor {
        name: r.name.clone(),
        description: r.caption.clone(),
        offset,
        size,
        access,
        reset_value,
        fields,
    })
}

/// `(offset, width)` of a contiguous mask.
fn mask_span(mask: u64) -> Option<(u32, u32)> {
    if mask == 0 {
        return None;
    }
    let offset = mask.trailing_zeros();
    let shifted = mask >> offset;
    let width = shifted.trailing_ones();
    (shifted.count_ones() == width).then_some((offset, width))
}
