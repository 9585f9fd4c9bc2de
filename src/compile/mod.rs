//! Network construction.
//!
//! [`NetworkCreator`] drives one translator per operation, in declaration
//! order, over a shared graph and operand-to-node table.

mod nodes;

pub use nodes::NodeTable;

use tracing::{debug, warn};

use crate::backend::{Graph, TensorDesc};
use crate::model::{Model, OperandType, OperationKind};
use crate::translate::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

/// A finished graph plus the bookkeeping the dispatcher needs to line
/// request arguments up with graph parameters and results.
#[derive(Debug)]
pub struct BuiltNetwork {
    pub graph: Graph,
    /// Per model input: true when it became a graph parameter.
    pub input_bindings: Vec<bool>,
    /// Per model output: true when it became a graph result.
    pub output_bindings: Vec<bool>,
    /// Operations wired, in order.
    pub trace: Vec<(usize, OperationKind)>,
}

impl BuiltNetwork {
    pub fn bound_inputs(&self) -> usize {
        self.input_bindings.iter().filter(|b| **b).count()
    }

    pub fn bound_outputs(&self) -> usize {
        self.output_bindings.iter().filter(|b| **b).count()
    }
}

pub struct NetworkCreator<'m> {
    model: &'m Model,
    translators: Vec<Option<Box<dyn Translator>>>,
}

impl std::fmt::Debug for NetworkCreator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCreator")
            .field("operations", &self.translators.len())
            .finish()
    }
}

impl<'m> NetworkCreator<'m> {
    pub fn new(model: &'m Model, registry: &TranslatorRegistry) -> Self {
        let translators = model
            .operations()
            .iter()
            .map(|op| {
                let translator = registry.create(op.kind);
                if translator.is_none() {
                    debug!(kind = %op.kind, "No translator registered");
                }
                translator
            })
            .collect();
        Self { model, translators }
    }

    fn supported(&self, index: usize) -> bool {
        let Some(Some(translator)) = self.translators.get(index) else {
            return false;
        };
        OperationView::new(self.model, index)
            .map(|view| translator.validate(&view))
            .unwrap_or(false)
    }

    /// Per-operation support, for capability queries.
    pub fn supported_operations(&self) -> Vec<bool> {
        (0..self.translators.len())
            .map(|index| {
                let supported = self.supported(index);
                debug!(index, supported, "Operation support");
                supported
            })
            .collect()
    }

    /// Fail on the first operation that has no translator or does not validate.
    pub fn validate_operations(&self) -> Result<(), BuildError> {
        for (index, translator) in self.translators.iter().enumerate() {
            let kind = self.model.operation_kind(index)?;
            if translator.is_none() {
                warn!(index, %kind, "Operation has no translator");
                return Err(BuildError::MissingTranslator { index, kind });
            }
            if !self.supported(index) {
                warn!(index, %kind, "Operation not supported");
                return Err(BuildError::Unsupported { index, kind });
            }
        }
        Ok(())
    }

    /// Build the graph. Any failure discards it.
    pub fn build(&self) -> Result<BuiltNetwork, BuildError> {
        let mut graph = Graph::new();
        let mut nodes = NodeTable::new(self.model.operand_count());

        let input_bindings = self.create_parameters(&mut graph, &mut nodes)?;

        let mut trace = Vec::with_capacity(self.translators.len());
        for (index, translator) in self.translators.iter().enumerate() {
            let op = self.model.operation(index)?;
            let Some(translator) = translator else {
                return Err(BuildError::MissingTranslator { index, kind: op.kind });
            };
            // Zero-sized inputs propagate: consumers are skipped and their
            // outputs left unbound.
            if op.inputs.iter().any(|&id| nodes.is_invalid(id)) {
                debug!(index, kind = %op.kind, "Skipping operation fed by a zero-sized operand");
                op.outputs.iter().for_each(|&id| nodes.mark_invalid(id));
                continue;
            }
            let view = OperationView::new(self.model, index)?;
            if !translator.validate(&view) {
                return Err(BuildError::Unsupported { index, kind: op.kind });
            }
            let mut ctx = TranslateContext::new(view, &mut graph, &mut nodes);
            translator.wire(&mut ctx).map_err(|e| {
                warn!(index, kind = %op.kind, error = %e, "Operation failed to build");
                e
            })?;
            trace.push((index, op.kind));
        }

        let mut output_bindings = Vec::with_capacity(self.model.output_count());
        for &id in self.model.outputs() {
            match nodes.get(id) {
                Some(node) => {
                    graph.result(node)?;
                    output_bindings.push(true);
                }
                None if nodes.is_invalid(id) => output_bindings.push(false),
                None => return Err(BuildError::UnwiredOutput { operand: id }),
            }
        }

        debug!(
            nodes = graph.nodes().len(),
            parameters = graph.parameters().len(),
            results = graph.results().len(),
            "Network built"
        );
        Ok(BuiltNetwork {
            graph,
            input_bindings,
            output_bindings,
            trace,
        })
    }

    /// Typed parameters for model inputs in declared order. Dimensionless or
    /// zero-sized inputs are marked invalid and keep their position.
    fn create_parameters(&self, graph: &mut Graph, nodes: &mut NodeTable) -> Result<Vec<bool>, BuildError> {
        let mut bindings = Vec::with_capacity(self.model.input_count());
        for &id in self.model.inputs() {
            let operand = self.model.operand(id)?;
            let dims = &operand.dimensions;
            if dims.is_empty() || dims.contains(&0) {
                debug!(operand = id, ?dims, "Model input is zero-sized");
                nodes.mark_invalid(id);
                bindings.push(false);
                continue;
            }
            if matches!(operand.operand_type, OperandType::Uint32 | OperandType::Float16) {
                return Err(BuildError::UnsupportedInputType {
                    operand: id,
                    operand_type: operand.operand_type,
                });
            }
            let shape: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
            let node = graph.parameter(TensorDesc::new(operand.operand_type.element_type(), &shape));
            nodes.set(id, node);
            bindings.push(true);
        }
        Ok(bindings)
    }
}
