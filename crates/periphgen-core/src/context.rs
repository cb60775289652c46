//! The per-request template context.
//!
//! A [`TemplateContext`] joins validated metadata with descriptor facts for
//! one (platform, peripheral) pair. It is built once per request, exposes
//! only shared references, and is never reused across requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::artifact::SourceIdentity;
use crate::descriptor::{Device, PeripheralDescriptor, PeripheralInstance, RegisterDescriptor};
use crate::digest::json_digest;
use crate::error::ContextError;
use crate::metadata::{
    BoardMetadata, PeripheralMetadata, PlatformMetadata, ValidatedMetadata,
};

#[derive(Debug, Clone)]
pub struct TemplateContext {
    platform: PlatformMetadata,
    peripheral: PeripheralMetadata,
    board: Option<BoardMetadata>,
    device: Arc<Device>,
    descriptor: SourceIdentity,
    platform_dir: PathBuf,
    layout: PeripheralDescriptor,
    instance: PeripheralInstance,
    metadata_digest: String,
    values: Value,
}

impl TemplateContext {
    /// Join validated metadata with the parsed descriptor.
    ///
    /// Fails when the peripheral names an instance the descriptor does not
    /// declare, or a role maps to a register the instance lacks.
    pub fn build(
        platform: &ValidatedMetadata,
        peripheral: &ValidatedMetadata,
        board: Option<&ValidatedMetadata>,
        device: Arc<Device>,
        descriptor: SourceIdentity,
    ) -> Result<Self, ContextError> {
        let platform_view = PlatformMetadata::from_validated(platform)?;
        let peripheral_view = PeripheralMetadata::from_validated(peripheral)?;
        let board_view = board.map(BoardMetadata::from_validated).transpose()?;

        let (layout, instance) = device
            .find_instance(&peripheral_view.instance)
            .map(|(l, i)| (l.clone(), i.clone()))
            .ok_or_else(|| ContextError::UnknownInstance {
                instance: peripheral_view.instance.clone(),
                device: device.name.clone(),
            })?;

        let mut roles = Map::new();
        for (role, register_name) in &peripheral_view.roles {
            let register =
                layout
                    .register(register_name)
                    .ok_or_else(|| ContextError::UnknownRegister {
                        role: role.clone(),
                        register: register_name.clone(),
                        instance: instance.name.clone(),
                    })?;
            roles.insert(
                role.clone(),
                register_value(register, instance.base_address),
            );
        }

        let metadata_digest = json_digest(&json!({
            "platform": platform.document(),
            "peripheral": peripheral.document(),
            "board": board.map(|b| b.document().clone()),
        }));

        let mut peripheral_value = serde_json::to_value(&peripheral_view).map_err(|e| {
            ContextError::InvalidMetadata {
                kind: "peripheral".to_string(),
                detail: e.to_string(),
            }
        })?;
        if let Value::Object(map) = &mut peripheral_value {
            map.insert("base_address".to_string(), json!(instance.base_address));
            map.insert("block_size".to_string(), json!(layout.block_size));
            map.insert("layout".to_string(), json!(layout.name));
            map.insert("roles".to_string(), Value::Object(roles));
        }

        let mut values = json!({
            "platform": platform_view,
            "peripheral": peripheral_value,
            "registers": layout
                .registers
                .iter()
                .map(|r| register_value(r, instance.base_address))
                .collect::<Vec<_>>(),
            "device": {
                "name": device.name,
                "dialect": device.dialect.name(),
            },
        });
        if let (Some(board_view), Value::Object(map)) = (&board_view, &mut values) {
            map.insert("board".to_string(), json!(board_view));
        }

        Ok(Self {
            platform: platform_view,
            peripheral: peripheral_view,
            board: board_view,
            device,
            descriptor,
            platform_dir: platform.resolve_path(""),
            layout,
            instance,
            metadata_digest,
            values,
        })
    }

    pub fn platform(&self) -> &PlatformMetadata {
        &self.platform
    }

    pub fn peripheral(&self) -> &PeripheralMetadata {
        &self.peripheral
    }

    pub fn board(&self) -> Option<&BoardMetadata> {
        self.board.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Identity of the descriptor file the device was parsed from.
    pub fn descriptor(&self) -> &SourceIdentity {
        &self.descriptor
    }

    /// Directory of the platform document; toolchain paths are relative to it.
    pub fn platform_dir(&self) -> &Path {
        &self.platform_dir
    }

    /// Resolve a path written in the platform document.
    pub fn resolve_platform_path(&self, relative: &str) -> PathBuf {
        self.platform_dir.join(relative)
    }

    /// Register layout of the target instance.
    pub fn layout(&self) -> &PeripheralDescriptor {
        &self.layout
    }

    pub fn instance(&self) -> &PeripheralInstance {
        &self.instance
    }

    pub fn base_address(&self) -> u64 {
        self.instance.base_address
    }

    pub fn metadata_digest(&self) -> &str {
        &self.metadata_digest
    }

    /// Register bound to `role` in the peripheral metadata.
    pub fn register_for_role(&self, role: &str) -> Option<&RegisterDescriptor> {
        self.peripheral
            .roles
            .get(role)
            .and_then(|name| self.layout.register(name))
    }

    /// `<family>/<peripheral>`, used as the request id in logs and reports.
    pub fn request_id(&self) -> String {
        format!("{}/{}", self.platform.family, self.peripheral.name)
    }

    /// The JSON value templates render against.
    pub fn values(&self) -> &Value {
        &self.values
    }
}

fn register_value(register: &RegisterDescriptor, base: u64) -> Value {
    json!({
        "name": register.name,
        "description": register.description,
        "offset": register.offset,
        "address": base + register.offset,
        "size": register.size,
        "access": register.access,
        "reset_value": register.reset_value,
        "fields": register
            .fields
            .iter()
            .map(|f| json!({
                "name": f.name,
                "description": f.description,
                "bit_offset": f.bit_offset,
                "bit_width": f.bit_width,
                "mask": f.mask(),
            }))
            .collect::<Vec<_>>(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::{AccessMode, Dialect};
    use crate::metadata::{DocumentKind, MetadataDocument};
    use crate::schema::validate;

    pub(crate) fn gpio_device() -> Device {
        let reg = |name: &str, offset: u64, access: AccessMode| RegisterDescriptor {
            name: name.to_string(),
            description: None,
            offset,
            size: 32,
            access,
            reset_value: 0,
            fields: Vec::new(),
        };
        Device {
            name: "STM32F4".to_string(),
            dialect: Dialect::CmsisSvd,
            peripherals: vec![PeripheralDescriptor {
                name: "GPIOA".to_string(),
                description: None,
                base_address: 0x4002_0000,
                block_size: 0x400,
                instances: vec![
                    PeripheralInstance {
                        name: "GPIOA".to_string(),
                        base_address: 0x4002_0000,
                    },
                    PeripheralInstance {
                        name: "GPIOB".to_string(),
                        base_address: 0x4002_0400,
                    },
                ],
                registers: vec![
                    reg("IDR", 0x10, AccessMode::ReadOnly),
                    reg("ODR", 0x14, AccessMode::ReadWrite),
                    reg("BSRR", 0x18, AccessMode::WriteOnly),
                ],
            }],
        }
    }

    pub(crate) fn platform_meta() -> ValidatedMetadata {
        let doc = MetadataDocument::from_value(
            "stm32f4.platform.json",
            json!({
                "schema_version": 1,
                "name": "stm32f4",
                "family": "stm32f4",
                "descriptor": "stm32f4.svd",
                "arch": "arm",
                "cpu": "cortex-m4",
                "toolchain": { "cc": "arm-none-eabi-gcc", "language": "c" },
                "idioms": { "atomic_set_clear": true, "toggle_register": false }
            }),
        );
        validate(&doc, DocumentKind::Platform).unwrap()
    }

    pub(crate) fn peripheral_meta(instance: &str) -> ValidatedMetadata {
        let doc = MetadataDocument::from_value(
            "gpioa.json",
            json!({
                "schema_version": 1,
                "name": "gpioa",
                "class": "digital_output",
                "instance": instance,
                "template": "gpio.c.j2",
                "pins": 16,
                "roles": { "set": "BSRR", "read": "IDR", "output": "ODR" },
                "entry_points": { "set": "gpioa_set", "read": "gpioa_read" }
            }),
        );
        validate(&doc, DocumentKind::Peripheral).unwrap()
    }

    pub(crate) fn context(instance: &str) -> TemplateContext {
        TemplateContext::build(
            &platform_meta(),
            &peripheral_meta(instance),
            None,
            Arc::new(gpio_device()),
            SourceIdentity::new("stm32f4.svd", b"<device/>"),
        )
        .unwrap()
    }

    #[test]
    fn test_context_exposes_instance_facts() {
        let ctx = context("GPIOA");
        assert_eq!(ctx.base_address(), 0x4002_0000);
        assert_eq!(ctx.request_id(), "stm32f4/gpioa");
        assert_eq!(ctx.register_for_role("set").unwrap().offset, 0x18);

        let values = ctx.values();
        assert_eq!(values["peripheral"]["base_address"], json!(0x4002_0000u64));
        assert_eq!(values["peripheral"]["roles"]["set"]["address"], json!(0x4002_0018u64));
        assert_eq!(values["registers"].as_array().unwrap().len(), 3);
        assert_eq!(values["platform"]["idioms"]["atomic_set_clear"], json!(true));
        assert!(values.get("board").is_none());
    }

    #[test]
    fn test_derived_instance_uses_own_base() {
        let ctx = context("GPIOB");
        assert_eq!(ctx.values()["peripheral"]["roles"]["set"]["address"], json!(0x4002_0418u64));
    }

    #[test]
    fn test_unknown_instance() {
        let err = TemplateContext::build(
            &platform_meta(),
            &peripheral_meta("GPIOZ"),
            None,
            Arc::new(gpio_device()),
            SourceIdentity::new("stm32f4.svd", b""),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::UnknownInstance { .. }));
    }

    #[test]
    fn test_unknown_role_register() {
        let mut device = gpio_device();
        device.peripherals[0].registers.retain(|r| r.name != "BSRR");
        let err = TemplateContext::build(
            &platform_meta(),
            &peripheral_meta("GPIOA"),
            None,
            Arc::new(device),
            SourceIdentity::new("stm32f4.svd", b""),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ContextError::UnknownRegister {
                role: "set".to_string(),
                register: "BSRR".to_string(),
                instance: "GPIOA".to_string(),
            }
        );
    }

    #[test]
    fn test_kinds_are_checked() {
        let err = TemplateContext::build(
            &peripheral_meta("GPIOA"),
            &peripheral_meta("GPIOA"),
            None,
            Arc::new(gpio_device()),
            SourceIdentity::new("stm32f4.svd", b""),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::WrongKind { .. }));
    }
}
