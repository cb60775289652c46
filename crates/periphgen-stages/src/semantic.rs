//! Semantic stage: trace every integer literal back to the descriptor.
//!
//! Hex literals are always checked. Decimal literals of at least `0x100` are
//! checked only when they fall inside the device address map; smaller ones
//! are loop bounds and bit positions. Address-like literals must be the target instance base or base plus a
//! declared register offset. A literal that lands in another instance's
//! window is the classic wrong-instance bug; it is reported together with
//! the value the target instance would have used. Small literals that match
//! no declared offset, reset value, mask or block size are reported as
//! warnings only.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use periphgen_core::{Artifact, Device, TemplateContext};
use regex::Regex;

use crate::cancel::Deadline;
use crate::diagnostic::{Location, StageDiagnostic};
use crate::error::StageError;
use crate::stage::{Stage, StageKind, StageResult, StageStatus};

fn int_literal() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:0[xX]([0-9A-Fa-f]+)|([1-9][0-9]*))(?:[uU]?[lL]{0,2}|[lL]{1,2}[uU])\b").ok()
    })
    .as_ref()
}

/// Decimal literals below this are never treated as addresses.
const MIN_DECIMAL_ADDRESS: u64 = 0x100;

/// An integer literal found in the artifact body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub text: String,
    pub value: u64,
    pub hex: bool,
    /// 1-indexed line in the full artifact text.
    pub line: usize,
    /// 1-indexed column.
    pub column: usize,
}

/// Hex literals, and decimal literals of at least `0x100`, outside the
/// provenance header.
pub fn scan_literals(artifact: &Artifact) -> Vec<Literal> {
    let Some(re) = int_literal() else {
        return Vec::new();
    };
    let skip = artifact.header_line_count();
    let mut found = Vec::new();
    for (index, line) in artifact.text.lines().enumerate().skip(skip) {
        for caps in re.captures_iter(line) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            // Literals wider than 64 bits cannot be addresses or masks.
            let (value, hex) = match (caps.get(1), caps.get(2)) {
                (Some(digits), _) => (u64::from_str_radix(digits.as_str(), 16), true),
                (None, Some(digits)) => (digits.as_str().parse::<u64>(), false),
                (None, None) => continue,
            };
            let Ok(value) = value else {
                continue;
            };
            if !hex && value < MIN_DECIMAL_ADDRESS {
                continue;
            }
            found.push(Literal {
                text: whole.as_str().to_string(),
                value,
                hex,
                line: index + 1,
                column: whole.start() + 1,
            });
        }
    }
    found
}

/// Facts about the target instance and the device address map.
struct AddressModel<'a> {
    device: &'a Device,
    base: u64,
    block_size: u64,
    /// Base plus every register offset, and the base itself.
    addresses: BTreeSet<u64>,
    /// Offsets, reset values, masks and sizes.
    constants: BTreeSet<u64>,
    span: Option<(u64, u64)>,
}

impl<'a> AddressModel<'a> {
    fn new(context: &'a TemplateContext) -> Self {
        let layout = context.layout();
        let base = context.base_address();

        let mut addresses = BTreeSet::from([base]);
        let mut constants = BTreeSet::from([layout.block_size]);
        for register in &layout.registers {
            addresses.insert(base + register.offset);
            constants.insert(register.offset);
            constants.insert(register.reset_value);
            for field in &register.fields {
                constants.insert(field.mask());
                constants.insert(field.unshifted_mask());
            }
        }

        Self {
            device: context.device(),
            base,
            block_size: layout.block_size,
            addresses,
            constants,
            span: context.device().address_span(),
        }
    }

    fn is_address_like(&self, value: u64) -> bool {
        if let Some((lo, hi)) = self.span {
            if value >= lo && value < hi {
                return true;
            }
        }
        self.device
            .instances()
            .any(|(p, i)| value >= i.base_address && value < i.base_address + p.block_size)
    }

    /// What the artifact should have said instead of `value`.
    fn expected_for(&self, value: u64) -> u64 {
        let foreign = self.device.instances().find(|(p, i)| {
            i.base_address != self.base
                && value >= i.base_address
                && value < i.base_address + p.block_size
        });
        if let Some((_, instance)) = foreign {
            let offset = value - instance.base_address;
            let candidate = self.base + offset;
            if offset < self.block_size && self.addresses.contains(&candidate) {
                return candidate;
            }
            return self.base;
        }
        self.addresses
            .iter()
            .copied()
            .min_by_key(|a| a.abs_diff(value))
            .unwrap_or(self.base)
    }
}

/// Check every literal; returns errors first, then warnings.
pub fn check_literals(artifact: &Artifact, context: &TemplateContext) -> Vec<StageDiagnostic> {
    let model = AddressModel::new(context);
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for literal in scan_literals(artifact) {
        let location = Location::new(
            artifact.file_name.clone(),
            Some(literal.line),
            Some(literal.column),
        );
        if model.is_address_like(literal.value) {
            if !model.addresses.contains(&literal.value) {
                let expected = model.expected_for(literal.value);
                let err = StageError::SemanticMismatchError {
                    literal: literal.text.clone(),
                    expected: format!("{expected:#010X}"),
                    location,
                };
                errors.push(err.to_diagnostic());
            }
        } else if literal.hex && !model.constants.contains(&literal.value) {
            warnings.push(
                StageDiagnostic::warning(format!(
                    "literal {} does not match any declared offset, reset value or mask of {}",
                    literal.text,
                    context.instance().name
                ))
                .with_location(location),
            );
        }
    }

    errors.extend(warnings);
    errors
}

/// Purely in-process; never invokes a tool.
#[derive(Debug, Default)]
pub struct SemanticStage;

impl SemanticStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for SemanticStage {
    fn kind(&self) -> StageKind {
        StageKind::Semantic
    }

    async fn run(
        &self,
        artifact: &Artifact,
        context: &TemplateContext,
        _deadline: &Deadline,
    ) -> StageResult {
        let started = Instant::now();
        let diagnostics = check_literals(artifact, context);
        let status = if diagnostics.iter().any(|d| d.is_error()) {
            StageStatus::Fail
        } else {
            StageStatus::Pass
        };
        StageResult::new(self.name(), status)
            .with_diagnostics(diagnostics)
            .timed(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{artifact_with_body, gpio_context};

    #[test]
    fn test_scan_skips_provenance_header() {
        let artifact = artifact_with_body("uint32_t x = 0x18u;\n");
        let literals = scan_literals(&artifact);
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].value, 0x18);
        assert_eq!(literals[0].text, "0x18u");
        assert_eq!(literals[0].line, artifact.header_line_count() + 1);
        assert_eq!(literals[0].column, 14);
    }

    #[test]
    fn test_scan_picks_up_large_decimals_only() {
        let artifact =
            artifact_with_body("for (i = 0; i < 16; i++) {}
uint32_t *p = (uint32_t *)1073873944u;
");
        let literals = scan_literals(&artifact);
        assert_eq!(literals.len(), 1);
        assert_eq!(literals[0].value, 0x4002_0418);
        assert!(!literals[0].hex);
        assert_eq!(literals[0].text, "1073873944u");
    }

    #[test]
    fn test_wrong_instance_decimal_address_is_flagged() {
        let ctx = gpio_context("GPIOA");
        // 0x40020418: GPIOB's ODR.
        let artifact = artifact_with_body("*(volatile uint32_t *)1073873944u = 1;
");
        let diags = check_literals(&artifact, &ctx);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].is_error());
        assert_eq!(diags[0].found.as_deref(), Some("1073873944u"));
        assert_eq!(diags[0].expected.as_deref(), Some("0x40020018"));
    }

    #[test]
    fn test_plain_decimal_constants_are_not_warned() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body("delay(1000);
baud = 115200;
");
        assert!(check_literals(&artifact, &ctx).is_empty());
    }

    #[test]
    fn test_correct_addresses_pass() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body(
            "#define BASE 0x40020000u\n*(volatile uint32_t *)0x40020018u = 1u;\n",
        );
        let diags = check_literals(&artifact, &ctx);
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_wrong_instance_base_is_flagged() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body("#define GPIOA_BASE 0x40020400u\n");
        let diags = check_literals(&artifact, &ctx);
        assert_eq!(diags.len(), 1);
        let d = &diags[0];
        assert!(d.is_error());
        assert_eq!(d.found.as_deref(), Some("0x40020400u"));
        assert_eq!(d.expected.as_deref(), Some("0x40020000"));
        assert_eq!(d.location.as_ref().unwrap().line, Some(artifact.header_line_count() + 1));
    }

    #[test]
    fn test_wrong_instance_register_maps_offset() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body("*(volatile uint32_t *)0x40020418 = 1;\n");
        let diags = check_literals(&artifact, &ctx);
        assert_eq!(diags[0].expected.as_deref(), Some("0x40020018"));
    }

    #[test]
    fn test_undeclared_offset_in_own_window_is_flagged() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body("*(volatile uint32_t *)0x40020019 = 1;\n");
        let diags = check_literals(&artifact, &ctx);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].expected.as_deref(), Some("0x40020018"));
    }

    #[test]
    fn test_unknown_small_literal_is_warning() {
        let ctx = gpio_context("GPIOA");
        let artifact = artifact_with_body("x = 0x1234;\ny = 0x18;\n");
        let diags = check_literals(&artifact, &ctx);
        assert_eq!(diags.len(), 1);
        assert!(!diags[0].is_error());
    }

    #[tokio::test]
    async fn test_stage_status() {
        let ctx = gpio_context("GPIOB");
        let deadline = crate::Deadline::after(
            std::time::Duration::from_secs(1),
            crate::CancelToken::never(),
        );
        let good = artifact_with_body("#define BASE 0x40020400u\n");
        let bad = artifact_with_body("#define BASE 0x40020000u\n");
        let stage = SemanticStage::new();
        assert_eq!(stage.run(&good, &ctx, &deadline).await.status, StageStatus::Pass);
        assert_eq!(stage.run(&bad, &ctx, &deadline).await.status, StageStatus::Fail);
    }
}
