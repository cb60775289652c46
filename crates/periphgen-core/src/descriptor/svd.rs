//! CMSIS-SVD dialect.
//!
//! Only the subset needed for driver generation is modelled: peripherals,
//! address blocks, registers and fields, plus the device-level register
//! property defaults and `derivedFrom` instancing.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::{
    locate, parse_int, to_bits, xml_error, AccessMode, BitFieldDescriptor, Device, Dialect,
    PeripheralDescriptor, PeripheralInstance, RegisterDescriptor,
};
use crate::error::DescriptorParseError;

#[derive(Debug, Deserialize)]
struct SvdDevice {
    name: String,
    size: Option<String>,
    access: Option<String>,
    #[serde(rename = "resetValue")]
    reset_value: Option<String>,
    peripherals: SvdPeripherals,
}

#[derive(Debug, Deserialize)]
struct SvdPeripherals {
    #[serde(rename = "peripheral", default)]
    peripheral: Vec<SvdPeripheral>,
}

#[derive(Debug, Deserialize)]
struct SvdPeripheral {
    #[serde(rename = "derivedFrom")]
    derived_from: Option<String>,
    name: String,
    description: Option<String>,
    #[serde(rename = "baseAddress")]
    base_address: String,
    size: Option<String>,
    #[serde(rename = "addressBlock", default)]
    address_block: Vec<SvdAddressBlock>,
    registers: Option<SvdRegisters>,
}

#[derive(Debug, Deserialize)]
struct SvdAddressBlock {
    offset: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct SvdRegisters {
    #[serde(rename = "register", default)]
    register: Vec<SvdRegister>,
}

#[derive(Debug, Deserialize)]
struct SvdRegister {
    name: String,
    description: Option<String>,
    #[serde(rename = "addressOffset")]
    address_offset: String,
    size: Option<String>,
    access: Option<String>,
    #[serde(rename = "resetValue")]
    reset_value: Option<String>,
    fields: Option<SvdFields>,
}

#[derive(Debug, Deserialize)]
struct SvdFields {
    #[serde(rename = "field", default)]
    field: Vec<SvdField>,
}

#[derive(Debug, Deserialize)]
struct SvdField {
    name: String,
    description: Option<String>,
    #[serde(rename = "bitOffset")]
    bit_offset: Option<String>,
    #[serde(rename = "bitWidth")]
    bit_width: Option<String>,
    #[serde(rename = "bitRange")]
    bit_range: Option<String>,
    lsb: Option<String>,
    msb: Option<String>,
    access: Option<String>,
}

/// Register property defaults inherited from the device level.
struct Defaults {
    size: u32,
    access: AccessMode,
    reset_value: u64,
}

struct Ctx<'a> {
    text: &'a str,
    origin: &'a Path,
}

impl Ctx<'_> {
    fn error(&self, element: &str, message: String) -> DescriptorParseError {
        DescriptorParseError::new(
            self.origin,
            locate(self.text, &format!("<name>{element}</name>")),
            message,
        )
    }

    fn int(&self, element: &str, what: &str, raw: &str) -> Result<u64, DescriptorParseError> {
        parse_int(raw).map_err(|e| self.error(element, format!("{element}: {what}: {e}")))
    }

    /// A bit count or position that must fit in `u32`.
    fn bits(&self, element: &str, what: &str, raw: &str) -> Result<u32, DescriptorParseError> {
        self.narrow(element, what, self.int(element, what, raw)?)
    }

    fn narrow(&self, element: &str, what: &str, value: u64) -> Result<u32, DescriptorParseError> {
        to_bits(value).map_err(|e| self.error(element, format!("{element}: {what}: {e}")))
    }

    fn access(&self, element: &str, raw: &str) -> Result<AccessMode, DescriptorParseError> {
        AccessMode::from_svd(raw)
            .ok_or_else(|| self.error(element, format!("{element}: unknown access {raw:?}")))
    }
}

/// Parse CMSIS-SVD text into a [`Device`].
pub fn parse(text: &str, origin: &Path) -> Result<Device, DescriptorParseError> {
    let raw: SvdDevice =
        serde_xml_rs::from_str(text).map_err(|e| xml_error(origin, e))?;
    let ctx = Ctx { text, origin };

    let defaults = Defaults {
        size: match &raw.size {
            Some(s) => ctx.bits(&raw.name, "size", s)?,
            None => 32,
        },
        access: match &raw.access {
            Some(a) => ctx.access(&raw.name, a)?,
            None => AccessMode::ReadWrite,
        },
        reset_value: match &raw.reset_value {
            Some(r) => ctx.int(&raw.name, "resetValue", r)?,
            None => 0,
        },
    };

    let mut peripherals: Vec<PeripheralDescriptor> = Vec::new();
    let mut by_instance: HashMap<String, usize> = HashMap::new();
    let mut derived: Vec<&SvdPeripheral> = Vec::new();

    for p in &raw.peripherals.peripheral {
        let has_registers = p
            .registers
            .as_ref()
            .is_some_and(|r| !r.register.is_empty());
        if p.derived_from.is_some() && !has_registers {
            derived.push(p);
            continue;
        }
        let descriptor = convert_peripheral(&ctx, p, &defaults)?;
        by_instance.insert(p.name.clone(), peripherals.len());
        peripherals.push(descriptor);
    }

    // Derived peripherals may chain; resolve until no progress is made.
    while !derived.is_empty() {
        let before = derived.len();
        let mut pending = Vec::new();
        for p in derived {
            let parent = p.derived_from.as_deref().unwrap_or_default();
            match by_instance.get(parent).copied() {
                Some(idx) => {
                    let base_address = ctx.int(&p.name, "baseAddress", &p.base_address)?;
                    peripherals[idx].instances.push(PeripheralInstance {
                        name: p.name.clone(),
                        base_address,
                    });
                    by_instance.insert(p.name.clone(), idx);
                }
                None => pending.push(p),
            }
        }
        if pending.len() == before {
            let p = pending[0];
            return Err(ctx.error(
                &p.name,
                format!(
                    "{} is derived from unknown peripheral {}",
                    p.name,
                    p.derived_from.as_deref().unwrap_or_default()
                ),
            ));
        }
        derived = pending;
    }

    Ok(Device {
        name: raw.name,
        dialect: Dialect::CmsisSvd,
        peripherals,
    })
}

fn convert_peripheral(
    ctx: &Ctx<'_>,
    p: &SvdPeripheral,
    defaults: &Defaults,
) -> Result<PeripheralDescriptor, DescriptorParseError> {
    let base_address = ctx.int(&p.name, "baseAddress", &p.base_address)?;
    let register_size = match &p.size {
        Some(s) => ctx.bits(&p.name, "size", s)?,
        None => defaults.size,
    };

    let mut registers = Vec::new();
    if let Some(regs) = &p.registers {
        for r in &regs.register {
            registers.push(convert_register(ctx, r, register_size, defaults)?);
        }
    }

    let mut block_size = 0u64;
    for block in &p.address_block {
        let offset = ctx.int(&p.name, "addressBlock offset", &block.offset)?;
        let size = ctx.int(&p.name, "addressBlock size", &block.size)?;
        block_size = block_size.max(offset.saturating_add(size));
    }
    if p.address_block.is_empty() {
        // No declared block: the registers themselves bound the window.
        block_size = registers
            .iter()
            .map(|r| r.offset + r.byte_size())
            .max()
            .unwrap_or(0);
    }

    Ok(PeripheralDescriptor {
        name: p.name.clone(),
        description: p.description.as_ref().map(|d| d.trim().to_string()),
        base_address,
        block_size,
        instances: vec![PeripheralInstance {
            name: p.name.clone(),
            base_address,
        }],
        registers,
    })
}

fn convert_register(
    ctx: &Ctx<'_>,
    r: &SvdRegister,
    default_size: u32,
    defaults: &Defaults,
) -> Result<RegisterDescriptor, DescriptorParseError> {
    let offset = ctx.int(&r.name, "addressOffset", &r.address_offset)?;
    let size = match &r.size {
        Some(s) => ctx.bits(&r.name, "size", s)?,
        None => default_size,
    };
    let access = match &r.access {
        Some(a) => ctx.access(&r.name, a)?,
        None => defaults.access,
    };
    let reset_value = match &r.reset_value {
        Some(v) => ctx.int(&r.name, "resetValue", v)?,
        None => defaults.reset_value,
    };

    let mut fields = Vec::new();
    if let Some(fs) = &r.fields {
        for f in &fs.field {
            fields.push(convert_field(ctx, f)?);
        }
    }

    Ok(RegisterDescriptor {
        name: r.name.clone(),
        description: r.description.as_ref().map(|d| d.trim().to_string()),
        offset,
        size,
        access,
        reset_value,
        fields,
    })
}

fn convert_field(ctx: &Ctx<'_>, f: &SvdField) -> Result<BitFieldDescriptor, DescriptorParseError> {
    let (bit_offset, bit_width) = match (&f.bit_offset, &f.bit_width, &f.bit_range, &f.lsb, &f.msb)
    {
        (Some(offset), Some(width), _, _, _) => (
            ctx.int(&f.name, "bitOffset", offset)?,
            ctx.int(&f.name, "bitWidth", width)?,
        ),
        (_, _, Some(range), _, _) => parse_bit_range(range)
            .ok_or_else(|| ctx.error(&f.name, format!("{}: invalid bitRange {range:?}", f.name)))?,
        (_, _, _, Some(lsb), Some(msb)) => {
            let lsb = ctx.int(&f.name, "lsb", lsb)?;
            let msb = ctx.int(&f.name, "msb", msb)?;
            if msb < lsb {
                return Err(ctx.error(&f.name, format!("{}: msb below lsb", f.name)));
            }
            (lsb, msb - lsb + 1)
        }
        _ => {
            return Err(ctx.error(
                &f.name,
                format!("{}: field has no bit position", f.name),
            ))
        }
    };

    let access = match &f.access {
        Some(a) => Some(ctx.access(&f.name, a)?),
        None => None,
    };

    Ok(BitFieldDescriptor {
        name: f.name.clone(),
        description: f.description.as_ref().map(|d| d.trim().to_string()),
        bit_offset: ctx.narrow(&f.name, "bit offset", bit_offset)?,
        bit_width: ctx.narrow(&f.name, "bit width", bit_width)?,
        access,
    })
}

/// `[msb:lsb]` → `(lsb, width)`.
fn parse_bit_range(raw: &str) -> Option<(u64, u64)> {
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (msb, lsb) = inner.split_once(':')?;
    let msb: u64 = msb.trim().parse().ok()?;
    let lsb: u64 = lsb.trim().parse().ok()?;
    (msb >= lsb).then_some((lsb, msb - lsb + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const GPIO_SVD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<device schemaVersion="1.1">
  <name>STM32F4</name>
  <size>32</size>
  <resetValue>0x00000000</resetValue>
  <peripherals>
    <peripheral>
      <name>GPIOA</name>
      <description>General-purpose I/Os</description>
      <baseAddress>0x40020000</baseAddress>
      <addressBlock>
        <offset>0x0</offset>
        <size>0x400</size>
        <usage>registers</usage>
      </addressBlock>
      <registers>
        <register>
          <name>IDR</name>
          <addressOffset>0x10</addressOffset>
          <access>read-only</access>
          <fields>
            <field>
              <name>IDR0</name>
              <bitRange>[0:0]</bitRange>
            </field>
          </fields>
        </register>
        <register>
          <name>BSRR</name>
          <addressOffset>0x18</addressOffset>
          <access>write-only</access>
          <fields>
            <field>
              <name>BS0</name>
              <bitOffset>0</bitOffset>
              <bitWidth>1</bitWidth>
            </field>
            <field>
              <name>BR0</name>
              <lsb>16</lsb>
              <msb>16</msb>
            </field>
          </fields>
        </register>
      </registers>
    </peripheral>
    <peripheral derivedFrom="GPIOA">
      <name>GPIOB</name>
      <baseAddress>0x40020400</baseAddress>
    </peripheral>
  </peripherals>
</device>
"#;

    fn origin() -> PathBuf {
        PathBuf::from("stm32f4.svd")
    }

    #[test]
    fn test_parse_gpio_svd() {
        let device = parse(GPIO_SVD, &origin()).unwrap();
        assert_eq!(device.name, "STM32F4");
        assert_eq!(device.dialect, Dialect::CmsisSvd);
        assert_eq!(device.peripherals.len(), 1);

        let gpio = &device.peripherals[0];
        assert_eq!(gpio.base_address, 0x4002_0000);
        assert_eq!(gpio.block_size, 0x400);
        assert_eq!(gpio.registers.len(), 2);

        let bsrr = gpio.register("BSRR").unwrap();
        assert_eq!(bsrr.offset, 0x18);
        assert_eq!(bsrr.size, 32);
        assert_eq!(bsrr.access, AccessMode::WriteOnly);
        assert_eq!(bsrr.fields[1].bit_offset, 16);
        assert_eq!(bsrr.fields[1].bit_width, 1);
    }

    #[test]
    fn test_register_wider_than_64_bits_is_error() {
        let text = GPIO_SVD.replace(
            "<addressOffset>0x10</addressOffset>",
            "<addressOffset>0x10</addressOffset>\n          <size>128</size>",
        );
        let text = text.replace(
            "<bitRange>[0:0]</bitRange>",
            "<bitOffset>100</bitOffset>\n              <bitWidth>4</bitWidth>",
        );
        let err = crate::descriptor::parse_str(&text, &origin()).unwrap_err();
        assert!(err.message.contains("GPIOA.IDR"), "{}", err.message);
        assert!(err.message.contains("128 bits"), "{}", err.message);
        assert!(err.line.is_some());
    }

    #[test]
    fn test_size_beyond_u32_is_not_truncated() {
        let text = GPIO_SVD.replace(
            "<addressOffset>0x18</addressOffset>",
            "<addressOffset>0x18</addressOffset>\n          <size>0x100000020</size>",
        );
        let err = parse(&text, &origin()).unwrap_err();
        assert!(err.message.contains("BSRR: size"), "{}", err.message);
        assert!(err.line.is_some());
    }

    #[test]
    fn test_field_end_overflow_is_error() {
        let text = GPIO_SVD.replace(
            "<bitOffset>0</bitOffset>\n              <bitWidth>1</bitWidth>",
            "<bitOffset>4294967295</bitOffset>\n              <bitWidth>2</bitWidth>",
        );
        let err = crate::descriptor::parse_str(&text, &origin()).unwrap_err();
        assert!(err.message.contains("BSRR.BS0"), "{}", err.message);
    }

    #[test]
    fn test_derived_peripheral_becomes_instance() {
        let device = parse(GPIO_SVD, &origin()).unwrap();
        let (layout, instance) = device.find_instance("GPIOB").unwrap();
        assert_eq!(layout.name, "GPIOA");
        assert_eq!(instance.base_address, 0x4002_0400);
        assert_eq!(layout.instances.len(), 2);
    }

    #[test]
    fn test_unknown_derived_from_is_error() {
        let text = GPIO_SVD.replace("derivedFrom=\"GPIOA\"", "derivedFrom=\"GPIOZ\"");
        let err = parse(&text, &origin()).unwrap_err();
        assert!(err.message.contains("GPIOZ"));
        assert!(err.line.is_some());
    }

    #[test]
    fn test_bad_access_is_located() {
        let text = GPIO_SVD.replace("<access>read-only</access>", "<access>sometimes</access>");
        let err = parse(&text, &origin()).unwrap_err();
        assert!(err.message.contains("sometimes"));
        assert!(err.line.is_some());
    }

    #[test]
    fn test_parse_bit_range() {
        assert_eq!(parse_bit_range("[7:4]"), Some((4, 4)));
        assert_eq!(parse_bit_range("[0:0]"), Some((0, 1)));
        assert_eq!(parse_bit_range("[3:4]"), None);
        assert_eq!(parse_bit_range("7:4"), None);
    }
}
