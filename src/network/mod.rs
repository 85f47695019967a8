//! Layer graph construction and finalisation.

mod compiled;

pub use compiled::{Batch, CompiledNetwork, StepMetrics};

use crate::{
    config::{is_no_origin, LayerConfig, LayerSpec, LayerType},
    layers::{
        Classifier, ConvPool, DotProduct, Dropout, Flatten, Input, Layer, Merge, Objective,
    },
    Error, Result,
};
use log::{debug, info, warn};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// A layer graph under construction.
///
/// Layers are added one at a time and every origin must already be present,
/// so insertion order is a topological order. [`Network::finalize`] consumes
/// the graph and returns the executable [`CompiledNetwork`].
#[derive(Debug)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    index: HashMap<String, usize>,
    origins: Vec<Vec<usize>>,
    rng: StdRng,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Reproducible initialisation and dropout masks.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            layers: Vec::new(),
            index: HashMap::new(),
            origins: Vec::new(),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, id: &str) -> Option<&dyn Layer> {
        self.index.get(id).map(|&i| self.layers[i].as_ref())
    }

    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.id()).collect()
    }

    /// Builds the layer described by `spec` against its origins' output
    /// shapes and adds it to the graph.
    pub fn add_layer(&mut self, spec: LayerSpec) -> Result<()> {
        let LayerSpec {
            id,
            origins,
            dropout_rate,
            config,
        } = spec;
        let kind = config.layer_type();
        let origins: Vec<String> = origins.into_iter().filter(|o| !is_no_origin(o)).collect();

        if self.index.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let origin_indices = origins
            .iter()
            .map(|origin| {
                self.index
                    .get(origin)
                    .copied()
                    .ok_or_else(|| Error::UnknownOrigin {
                        layer: id.clone(),
                        origin: origin.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let count_ok = match kind {
            LayerType::Input => origin_indices.is_empty(),
            LayerType::Merge => origin_indices.len() >= 2,
            _ => origin_indices.len() == 1,
        };
        if !count_ok {
            let expected = match kind {
                LayerType::Input => "no origins",
                LayerType::Merge => "at least two origins",
                _ => "exactly one origin",
            };
            return Err(Error::config(
                &id,
                format!(
                    "a {} layer takes {}, got {:?}",
                    kind, expected, origins
                ),
            ));
        }

        if dropout_rate != 0.0 && kind == LayerType::Objective {
            return Err(Error::config(&id, "an objective layer cannot carry dropout"));
        }

        let input_shapes: Vec<Vec<usize>> = origin_indices
            .iter()
            .map(|&i| self.layers[i].output_shape().to_vec())
            .collect();

        let layer = self.build(&id, &input_shapes, config)?;
        let layer: Box<dyn Layer> = if dropout_rate != 0.0 {
            Box::new(Dropout::new(layer, dropout_rate)?)
        } else {
            layer
        };

        debug!(
            "added layer `{}` ({}) with output shape {:?}",
            id,
            kind,
            layer.output_shape()
        );

        self.index.insert(id, self.layers.len());
        self.layers.push(layer);
        self.origins.push(origin_indices);
        Ok(())
    }

    /// [`LayerSpec::from_json`] followed by [`Network::add_layer`].
    pub fn add_layer_json(&mut self, json: &str) -> Result<()> {
        self.add_layer(LayerSpec::from_json(json)?)
    }

    fn build(
        &mut self,
        id: &str,
        input_shapes: &[Vec<usize>],
        config: LayerConfig,
    ) -> Result<Box<dyn Layer>> {
        let first = || first_shape(id, input_shapes);

        Ok(match config {
            LayerConfig::Input(c) => Box::new(Input::new(id, c)?),
            LayerConfig::ConvPool(c) => Box::new(ConvPool::new(id, first()?, c, &mut self.rng)?),
            LayerConfig::DotProduct(c) => {
                Box::new(DotProduct::new(id, first()?, c, &mut self.rng)?)
            }
            LayerConfig::Flatten(_) => Box::new(Flatten::new(id, first()?)?),
            LayerConfig::Merge(c) => Box::new(Merge::new(id, input_shapes, c)?),
            LayerConfig::Classifier(c) => {
                Box::new(Classifier::new(id, first()?, c, &mut self.rng)?)
            }
            LayerConfig::Objective(c) => Box::new(Objective::new(id, first()?, c)?),
        })
    }

    fn lookup(&self, id: &str, kind: LayerType) -> Result<usize> {
        let idx = *self.index.get(id).ok_or_else(|| {
            Error::IncompleteGraph(format!("no {} layer with id `{}`", kind, id))
        })?;
        let actual = self.layers[idx].layer_type();
        if actual != kind {
            return Err(Error::IncompleteGraph(format!(
                "layer `{}` is a {} layer, expected {}",
                id, actual, kind
            )));
        }
        Ok(idx)
    }

    /// `start` and everything it depends on.
    fn ancestors(&self, start: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(&self.origins[idx]);
            }
        }
        seen
    }

    /// Fixes the structure and aggregates parameters, update rules and
    /// regularisation along the path from `input` to `objective`.
    pub fn finalize(mut self, objective: &str, input: &str) -> Result<CompiledNetwork> {
        let objective_idx = self.lookup(objective, LayerType::Objective)?;
        let input_idx = self.lookup(input, LayerType::Input)?;

        // Insertion order is already topological; sorting only rejects cycles.
        let ids: Vec<&str> = self.layers.iter().map(|l| l.id()).collect();
        topological_order(&ids, &self.origins)?;
        let order = 0..self.layers.len();

        let train_set = self.ancestors(objective_idx);
        if let Some(&other) = train_set
            .iter()
            .find(|&&i| i != input_idx && self.layers[i].layer_type() == LayerType::Input)
        {
            return Err(Error::IncompleteGraph(format!(
                "objective `{}` depends on input `{}`, not `{}`",
                objective,
                self.layers[other].id(),
                input
            )));
        }
        if !train_set.contains(&input_idx) {
            return Err(Error::IncompleteGraph(format!(
                "objective `{}` does not depend on input `{}`",
                objective, input
            )));
        }

        let classifier_idx = self.origins[objective_idx][0];
        if self.layers[classifier_idx].layer_type() != LayerType::Classifier {
            return Err(Error::IncompleteGraph(format!(
                "objective `{}` must be fed by a classifier, `{}` is a {} layer",
                objective,
                self.layers[classifier_idx].id(),
                self.layers[classifier_idx].layer_type()
            )));
        }
        let inference_set = self.ancestors(classifier_idx);

        let train_path: Vec<usize> = order
            .clone()
            .filter(|i| train_set.contains(i))
            .collect();
        let inference_path: Vec<usize> = order.filter(|i| inference_set.contains(i)).collect();

        for layer in self
            .layers
            .iter()
            .enumerate()
            .filter(|(i, _)| !train_set.contains(i))
            .map(|(_, l)| l)
        {
            warn!(
                "layer `{}` is not reachable from objective `{}` and will not be trained",
                layer.id(),
                objective
            );
        }

        let seed = self.rng.gen();
        let compiled = CompiledNetwork::new(compiled::Graph {
            layers: self.layers,
            index: self.index,
            origins: self.origins,
            train_path,
            inference_path,
            input: input_idx,
            classifier: classifier_idx,
            objective: objective_idx,
            seed,
        })?;

        info!(
            "finalized network: {} layers on the train path, {} trainable and {} auxiliary params, {} update rules",
            compiled.train_path().len(),
            compiled.trainable_params().len(),
            compiled.auxiliary_params().len(),
            compiled.all_update_rules().len()
        );
        Ok(compiled)
    }
}

fn first_shape<'s>(id: &str, shapes: &'s [Vec<usize>]) -> Result<&'s [usize]> {
    shapes
        .first()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::config(id, "missing origin"))
}

/// Orders layer indices so every origin precedes its consumers.
pub(crate) fn topological_order(ids: &[&str], origins: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..ids.len()).map(|i| graph.add_node(i)).collect();
    for (consumer, from) in origins.iter().enumerate() {
        for &origin in from {
            graph.add_edge(nodes[origin], nodes[consumer], ());
        }
    }

    toposort(&graph, None)
        .map(|sorted| sorted.into_iter().map(|n| graph[n]).collect())
        .map_err(|cycle| Error::Cycle(ids[graph[cycle.node_id()]].to_string()))
}
