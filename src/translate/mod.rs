//! Operation translators.
//!
//! One [`Translator`] per operation kind turns an operation's operands into
//! backend graph nodes. Translators are stateless; the [`TranslatorRegistry`]
//! maps each supported kind to a factory.

mod common;
mod context;
mod conv;
mod elementwise;
mod error;
mod normalization;
mod pooling;
mod quant;
mod reduction;
mod resize;
mod shape;

use std::collections::HashMap;

use crate::backend::NodeRef;
use crate::model::OperationKind;

pub use common::{
    calculate_explicit_padding, normalize_axis, per_channel_bias_scales, LayoutConversion,
    ACTIVATION_NONE, ACTIVATION_RELU, ACTIVATION_RELU1, ACTIVATION_RELU6, PADDING_SAME,
    PADDING_VALID,
};
pub use context::{OperationView, TranslateContext};
pub use error::BuildError;

/// Per-kind translation behavior.
pub trait Translator: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Whether this operation instance can be translated.
    fn validate(&self, _op: &OperationView<'_>) -> bool {
        true
    }

    /// Build the node producing the primary output in real-valued form.
    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError>;

    /// Build and bind the outputs. The default quantizes the primary output
    /// when its operand is a quantized type.
    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let node = self.build(ctx)?;
        ctx.finish(0, node)
    }
}

pub type TranslatorFactory = fn(OperationKind) -> Box<dyn Translator>;

/// Operation kind to translator factory.
#[derive(Clone, Default)]
pub struct TranslatorRegistry {
    factories: HashMap<OperationKind, TranslatorFactory>,
}

impl std::fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatorRegistry")
            .field("kinds", &self.factories.len())
            .finish()
    }
}

impl TranslatorRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in translator.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        elementwise::register(&mut registry);
        conv::register(&mut registry);
        pooling::register(&mut registry);
        normalization::register(&mut registry);
        reduction::register(&mut registry);
        shape::register(&mut registry);
        quant::register(&mut registry);
        resize::register(&mut registry);
        registry
    }

    pub fn register(&mut self, kind: OperationKind, factory: TranslatorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: OperationKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, kind: OperationKind) -> Option<Box<dyn Translator>> {
        self.factories.get(&kind).map(|factory| factory(kind))
    }

    /// Registered kinds in vocabulary order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .iter()
            .copied()
            .filter(|k| self.supports(*k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_coverage() {
        let registry = TranslatorRegistry::standard();
        let expected = [
            OperationKind::Add,
            OperationKind::Conv2d,
            OperationKind::DepthwiseConv2d,
            OperationKind::GroupedConv2d,
            OperationKind::FullyConnected,
            OperationKind::AveragePool2d,
            OperationKind::Softmax,
            OperationKind::InstanceNormalization,
            OperationKind::Mean,
            OperationKind::ArgMax,
            OperationKind::Split,
            OperationKind::StridedSlice,
            OperationKind::Quantize,
            OperationKind::Dequantize,
            OperationKind::HardSwish,
            OperationKind::TransposeConv2d,
            OperationKind::ResizeBilinear,
            OperationKind::ResizeNearestNeighbor,
            OperationKind::BatchToSpaceNd,
            OperationKind::SpaceToBatchNd,
            OperationKind::ChannelShuffle,
            OperationKind::LocalResponseNormalization,
            OperationKind::TopkV2,
        ];
        for kind in expected {
            assert!(registry.supports(kind), "{kind} not registered");
            assert_eq!(registry.create(kind).unwrap().kind(), kind);
        }
        assert_eq!(registry.kinds().len(), 78);
    }

    #[test]
    fn test_unregistered_kinds_are_absent() {
        let registry = TranslatorRegistry::standard();
        assert!(!registry.supports(OperationKind::Lstm));
        assert!(registry.create(OperationKind::While).is_none());
        assert!(TranslatorRegistry::empty().kinds().is_empty());
    }
}
