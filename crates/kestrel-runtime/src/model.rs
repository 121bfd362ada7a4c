use std::collections::HashMap;

use kestrel_core::{EngineError, Result};

use crate::format::{ModelConfig, TensorMetadata};
use crate::tensor::Tensor;

/// A loaded model: the parsed configuration plus every tensor it declares.
///
/// Tensors are exposed in table order, which is the execution order.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    tensors: Vec<Tensor>,
    by_name: HashMap<String, usize>,
    /// `order[i]` is the tensor backing table entry `i`.
    order: Vec<usize>,
}

impl Model {
    /// Take ownership of `tensors` and index them against the table.
    ///
    /// Every table entry must resolve to exactly one tensor by name and the
    /// counts must agree; otherwise no model is produced.
    pub fn assemble(config: ModelConfig, tensors: Vec<Tensor>) -> Result<Self> {
        if tensors.len() != config.tensors.len() {
            return Err(EngineError::TensorCountMismatch { expected: config.tensors.len(), actual: tensors.len() });
        }

        let mut by_name = HashMap::with_capacity(tensors.len());
        for (i, tensor) in tensors.iter().enumerate() {
            if by_name.insert(tensor.name().to_string(), i).is_some() {
                return Err(EngineError::DuplicateTensor(tensor.name().to_string()));
            }
        }

        let mut order = Vec::with_capacity(config.tensors.len());
        let mut seen = vec![false; tensors.len()];
        for entry in &config.tensors {
            let index = *by_name
                .get(&entry.name)
                .ok_or_else(|| EngineError::TensorNotFound(entry.name.clone()))?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(EngineError::DuplicateTensor(entry.name.clone()));
            }
            order.push(index);
        }

        Ok(Self { config, tensors, by_name, order })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of table entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.by_name.get(name).map(|&i| &self.tensors[i])
    }

    /// Table entry `index` and its tensor.
    pub fn entry(&self, index: usize) -> Option<(&TensorMetadata, &Tensor)> {
        let meta = self.config.tensors.get(index)?;
        Some((meta, &self.tensors[self.order[index]]))
    }

    /// Tensors in execution order.
    pub fn execution_order(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.order.iter().map(move |&i| &self.tensors[i])
    }

    /// Transformer layer a table entry belongs to, if any.
    pub fn layer_of(&self, index: usize) -> Option<usize> {
        let meta = self.config.tensors.get(index)?;
        layer_index(&meta.name, self.config.header.layer_count as usize)
    }
}

/// Layer index encoded in a tensor name: the first dot-separated segment
/// made only of digits, if it is below `layer_count`.
pub fn layer_index(name: &str, layer_count: usize) -> Option<usize> {
    name.split('.')
        .find(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|seg| seg.parse::<usize>().ok())
        .filter(|&layer| layer < layer_count)
}
