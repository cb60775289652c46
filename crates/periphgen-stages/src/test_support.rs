//! Shared fixtures for unit tests.

use std::sync::Arc;

use periphgen_core::{
    validate, AccessMode, Artifact, BitFieldDescriptor, Device, Dialect, DocumentKind,
    MetadataDocument, PeripheralDescriptor, PeripheralInstance, RegisterDescriptor,
    SourceIdentity, TemplateContext, TemplateEngine, TemplateSource,
};
use serde_json::json;

/// STM32F4-style GPIOA/GPIOB sharing one layout.
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
    let mut bsrr = reg("BSRR", 0x18, AccessMode::WriteOnly);
    bsrr.fields.push(BitFieldDescriptor {
        name: "BR0".to_string(),
        description: None,
        bit_offset: 16,
        bit_width: 1,
        access: None,
    });
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
                bsrr,
            ],
        }],
    }
}

pub(crate) fn gpio_context(instance: &str) -> TemplateContext {
    let platform = MetadataDocument::from_value(
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
    let peripheral = MetadataDocument::from_value(
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
    TemplateContext::build(
        &validate(&platform, DocumentKind::Platform).unwrap(),
        &validate(&peripheral, DocumentKind::Peripheral).unwrap(),
        None,
        Arc::new(gpio_device()),
        SourceIdentity::new("stm32f4.svd", b"<device/>"),
    )
    .unwrap()
}

/// A provenance-stamped `gpioa.c` whose body is `body` verbatim.
pub(crate) fn artifact_with_body(body: &str) -> Artifact {
    TemplateEngine::default()
        .render(&TemplateSource::new("gpio.c.j2", body), &gpio_context("GPIOA"))
        .unwrap()
}
